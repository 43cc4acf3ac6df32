//! In-memory cluster
//!
//! Keeps namespaces, service accounts, bindings and workloads in process so the
//! whole workflow can run without a live control plane. Behaviour that a real
//! cluster decides on its own (access, token contents, workload results) is
//! scripted through the builder methods.

use super::{async_trait, ClusterClient, ClusterError};
use crate::models::{
    AccessReview, Ensured, ResourceRef, RoleGrant, WorkloadPhase, WorkloadSpec,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Scripted result of a workload, keyed by workload name
#[derive(Debug, Clone)]
struct ScriptedWorkload {
    phase: WorkloadPhase,
    output: String,
    /// Number of phase checks answered with `Running` before `phase`
    running_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeSet<String>,
    service_accounts: BTreeSet<(String, String)>,
    bindings: BTreeMap<String, RoleGrant>,
    services: BTreeMap<(String, String), BTreeMap<String, String>>,
    routes: BTreeMap<(String, String), String>,
    workloads: HashMap<ResourceRef, WorkloadSpec>,
    polls: HashMap<ResourceRef, u32>,
    minted: Vec<String>,
    delete_requests: Vec<ResourceRef>,
    mutations: usize,
}

/// Cluster implementation backed by process memory
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    access: Result<AccessReview, ClusterError>,
    token: Option<Result<String, ClusterError>>,
    scripted: HashMap<String, ScriptedWorkload>,
    fail_deletes: bool,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// Empty cluster with an authenticated, privileged session
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            access: Ok(AccessReview {
                can_create_namespaces: true,
            }),
            token: None,
            scripted: HashMap::new(),
            fail_deletes: false,
        }
    }

    /// Session whose credentials are rejected
    pub fn unauthenticated(mut self) -> Self {
        self.access = Err(ClusterError::Unauthorized("Unauthorized".to_string()));
        self
    }

    /// Session that cannot reach the API server
    pub fn unreachable(mut self) -> Self {
        self.access = Err(ClusterError::Unreachable("connection refused".to_string()));
        self
    }

    /// Authenticated session lacking namespace-create permission
    pub fn without_privilege(mut self) -> Self {
        self.access = Ok(AccessReview {
            can_create_namespaces: false,
        });
        self
    }

    /// Pre-existing service
    pub fn with_service(self, namespace: &str, name: &str) -> Self {
        self.lock()
            .services
            .insert((namespace.to_string(), name.to_string()), BTreeMap::new());
        self
    }

    /// Pre-existing route exposing `host`
    pub fn with_route(self, namespace: &str, name: &str, host: &str) -> Self {
        self.lock().routes.insert(
            (namespace.to_string(), name.to_string()),
            host.to_string(),
        );
        self
    }

    /// Every token request returns `token`
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(Ok(token.to_string()));
        self
    }

    /// Every token request fails with `err`
    pub fn with_token_error(mut self, err: ClusterError) -> Self {
        self.token = Some(Err(err));
        self
    }

    /// Workload `name` finishes in `phase` printing `output`
    pub fn with_workload(mut self, name: &str, phase: WorkloadPhase, output: &str) -> Self {
        let running_polls = self.scripted.get(name).map_or(0, |w| w.running_polls);
        self.scripted.insert(
            name.to_string(),
            ScriptedWorkload {
                phase,
                output: output.to_string(),
                running_polls,
            },
        );
        self
    }

    /// Workload `name` reports `Running` for the first `polls` phase checks
    pub fn with_workload_delay(mut self, name: &str, polls: u32) -> Self {
        self.scripted
            .entry(name.to_string())
            .or_insert_with(|| ScriptedWorkload {
                phase: WorkloadPhase::Succeeded,
                output: String::new(),
                running_polls: 0,
            })
            .running_polls = polls;
        self
    }

    /// Workload `name` never finishes
    pub fn with_stuck_workload(self, name: &str) -> Self {
        self.with_workload_delay(name, u32::MAX)
    }

    /// Every delete request fails
    pub fn with_failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    pub fn service_accounts(&self) -> Vec<(String, String)> {
        self.lock().service_accounts.iter().cloned().collect()
    }

    pub fn role_bindings(&self) -> Vec<RoleGrant> {
        self.lock().bindings.values().cloned().collect()
    }

    pub fn service_annotations(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Tokens handed out so far
    pub fn minted_tokens(&self) -> Vec<String> {
        self.lock().minted.clone()
    }

    /// Every delete request received, including failed ones
    pub fn delete_requests(&self) -> Vec<ResourceRef> {
        self.lock().delete_requests.clone()
    }

    /// Workloads that still exist
    pub fn live_workloads(&self) -> Vec<ResourceRef> {
        self.lock().workloads.keys().cloned().collect()
    }

    /// Number of successful state-changing calls
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_namespace(state: &State, namespace: &str) -> Result<(), ClusterError> {
        if state.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(ClusterError::NotFound(format!("namespace {}", namespace)))
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn review_access(&self) -> Result<AccessReview, ClusterError> {
        self.access.clone()
    }

    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        Ok(self
            .lock()
            .services
            .contains_key(&(namespace.to_string(), name.to_string())))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<Ensured, ClusterError> {
        let mut state = self.lock();
        if state.namespaces.insert(name.to_string()) {
            state.mutations += 1;
            Ok(Ensured::Created)
        } else {
            Ok(Ensured::AlreadyExisted)
        }
    }

    async fn ensure_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Ensured, ClusterError> {
        let mut state = self.lock();
        Self::require_namespace(&state, namespace)?;
        if state
            .service_accounts
            .insert((namespace.to_string(), name.to_string()))
        {
            state.mutations += 1;
            Ok(Ensured::Created)
        } else {
            Ok(Ensured::AlreadyExisted)
        }
    }

    async fn bind_cluster_role(&self, grant: &RoleGrant) -> Result<Ensured, ClusterError> {
        let mut state = self.lock();
        let previous = state
            .bindings
            .insert(grant.binding_name.clone(), grant.clone());
        match previous {
            Some(existing) if existing == *grant => Ok(Ensured::AlreadyExisted),
            Some(_) => {
                state.mutations += 1;
                Ok(Ensured::AlreadyExisted)
            }
            None => {
                state.mutations += 1;
                Ok(Ensured::Created)
            }
        }
    }

    async fn mint_token(
        &self,
        namespace: &str,
        service_account: &str,
        _validity: Duration,
    ) -> Result<String, ClusterError> {
        let mut state = self.lock();
        if !state
            .service_accounts
            .contains(&(namespace.to_string(), service_account.to_string()))
        {
            return Err(ClusterError::NotFound(format!(
                "serviceaccount {}/{}",
                namespace, service_account
            )));
        }

        let token = match &self.token {
            Some(scripted) => scripted.clone()?,
            None => format!(
                "token-{}-{}-{}",
                namespace,
                service_account,
                state.minted.len() + 1
            ),
        };
        state.minted.push(token.clone());
        Ok(token)
    }

    async fn resolve_route(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, ClusterError> {
        Ok(self
            .lock()
            .routes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn annotate_service(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let existing = state
            .services
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::NotFound(format!("service {}/{}", namespace, name)))?;
        existing.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.mutations += 1;
        Ok(())
    }

    async fn launch_workload(&self, spec: &WorkloadSpec) -> Result<(), ClusterError> {
        let mut state = self.lock();
        Self::require_namespace(&state, &spec.namespace)?;
        let key = spec.resource_ref();
        if state.workloads.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }
        state.polls.insert(key.clone(), 0);
        state.workloads.insert(key, spec.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn workload_phase(&self, workload: &ResourceRef) -> Result<WorkloadPhase, ClusterError> {
        let mut state = self.lock();
        if !state.workloads.contains_key(workload) {
            return Ok(WorkloadPhase::Missing);
        }

        let polls = state.polls.entry(workload.clone()).or_insert(0);
        *polls = polls.saturating_add(1);
        let polls = *polls;

        Ok(match self.scripted.get(&workload.name) {
            Some(script) if polls <= script.running_polls => WorkloadPhase::Running,
            Some(script) => script.phase,
            None => WorkloadPhase::Succeeded,
        })
    }

    async fn workload_output(&self, workload: &ResourceRef) -> Result<String, ClusterError> {
        let state = self.lock();
        if !state.workloads.contains_key(workload) {
            return Err(ClusterError::NotFound(workload.to_string()));
        }
        Ok(self
            .scripted
            .get(&workload.name)
            .map(|w| w.output.clone())
            .unwrap_or_default())
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.delete_requests.push(resource.clone());
        if self.fail_deletes {
            return Err(ClusterError::Api(format!("cannot delete {}", resource)));
        }
        if state.workloads.remove(resource).is_some() {
            state.mutations += 1;
        }
        Ok(())
    }
}
