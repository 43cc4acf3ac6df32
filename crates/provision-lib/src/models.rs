//! Core data models for the provisioning workflow

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result of an idempotent create call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ensured {
    Created,
    AlreadyExisted,
}

impl Ensured {
    pub fn describe(&self) -> &'static str {
        match self {
            Ensured::Created => "created",
            Ensured::AlreadyExisted => "already exists",
        }
    }
}

/// What the current session is allowed to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessReview {
    pub can_create_namespaces: bool,
}

/// Grant of a pre-existing cluster role to a service account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    /// Name of the ClusterRoleBinding object
    pub binding_name: String,
    /// Pre-existing ClusterRole being granted
    pub cluster_role: String,
    pub namespace: String,
    pub service_account: String,
}

impl RoleGrant {
    /// Identity string the API server uses for the service account
    pub fn identity(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }
}

/// Reachable URLs of the metrics query API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    pub internal: String,
}

impl EndpointDescriptor {
    const EXTERNAL_KEY: &'static str = "External:";
    const INTERNAL_KEY: &'static str = "Internal:";

    /// Build a descriptor from an optional route host and the in-cluster URL
    pub fn new(route_host: Option<&str>, internal: impl Into<String>) -> Self {
        Self {
            external: route_host
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(|h| format!("https://{}", h)),
            internal: internal.into(),
        }
    }

    /// Render the descriptor file contents
    pub fn to_descriptor_text(&self) -> String {
        let mut text = String::new();
        if let Some(external) = &self.external {
            text.push_str(&format!("{} {}\n", Self::EXTERNAL_KEY, external));
        }
        text.push_str(&format!("{} {}\n", Self::INTERNAL_KEY, self.internal));
        text
    }

    /// Parse a descriptor file written by [`to_descriptor_text`](Self::to_descriptor_text)
    pub fn parse(text: &str) -> Option<Self> {
        let mut external = None;
        let mut internal = None;

        for line in text.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix(Self::EXTERNAL_KEY) {
                external = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix(Self::INTERNAL_KEY) {
                internal = Some(value.trim().to_string());
            }
        }

        Some(Self {
            external: external.filter(|v| !v.is_empty()),
            internal: internal.filter(|v| !v.is_empty())?,
        })
    }
}

/// Kinds of cluster resources the workflow deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Job,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::Job => write!(f, "job"),
        }
    }
}

/// Reference to a namespaced resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} in {}", self.kind, self.name, self.namespace)
    }
}

/// Short-lived workload launched to probe the metrics endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub service_account: String,
    pub image: String,
    /// Command run through `/bin/sh -c`
    pub script: String,
    /// Environment passed to the container
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Observed lifecycle phase of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The workload could not be found
    Missing,
}

impl WorkloadPhase {
    /// Returns true once the workload will not change phase again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed | WorkloadPhase::Missing
        )
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadPhase::Pending => "pending",
            WorkloadPhase::Running => "running",
            WorkloadPhase::Succeeded => "succeeded",
            WorkloadPhase::Failed => "failed",
            WorkloadPhase::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// Final phase and captured output of an ephemeral workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRun {
    pub phase: WorkloadPhase,
    /// False when the wait timed out before the workload finished
    pub finished: bool,
    pub output: String,
}

/// Paths of the artifacts written during a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_config_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries_file: Option<String>,
}
