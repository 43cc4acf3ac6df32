//! Kubernetes API backed cluster client
//!
//! Talks to the control plane with `kube`. OpenShift routes are read as
//! dynamic objects so the same client works on clusters without the Route API.

use super::{async_trait, ClusterClient, ClusterError};
use crate::models::{
    AccessReview, Ensured, ResourceKind, ResourceRef, RoleGrant, WorkloadPhase, WorkloadSpec,
};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, Namespace, Pod, PodSpec, PodTemplateSpec, SeccompProfile,
    SecurityContext, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "dtp";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label the job controller puts on every pod it creates
const JOB_UID_LABEL: &str = "controller-uid";

/// Cluster client talking to a live API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig and/or context, or the inferred
    /// configuration (KUBECONFIG, ~/.kube/config, in-cluster)
    pub async fn connect(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
    ) -> Result<Self, ClusterError> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Unreachable(format!(
                        "cannot read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterError::Unreachable(e.to_string()))?
            }
            None if context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ClusterError::Unreachable(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Unreachable(e.to_string()))?,
        };

        info!(cluster_url = %config.cluster_url, "Using cluster");

        let client =
            Client::try_from(config).map_err(|e| ClusterError::Unreachable(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Pod created by the current incarnation of `job`.
    ///
    /// A job deleted by an earlier run may leave its pod behind under the same
    /// `job-name`, so pods are matched on the job's uid instead.
    async fn first_job_pod(&self, job: &ResourceRef) -> Result<Option<String>, ClusterError> {
        let what = job.to_string();
        let uid = self
            .jobs(&job.namespace)
            .get_opt(&job.name)
            .await
            .map_err(|e| map_error(e, &what))?
            .and_then(|j| j.metadata.uid)
            .ok_or_else(|| ClusterError::NotFound(what.clone()))?;

        let pods = self
            .pods(&job.namespace)
            .list(&ListParams::default().labels(&job_pod_selector(&uid)))
            .await
            .map_err(|e| map_error(e, &what))?;
        Ok(select_job_pod(pods.items, &uid))
    }
}

fn job_pod_selector(uid: &str) -> String {
    format!("{}={}", JOB_UID_LABEL, uid)
}

/// Name of a live pod owned by the job with `uid`
fn select_job_pod(pods: Vec<Pod>, uid: &str) -> Option<String> {
    pods.into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter(|p| {
            p.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(JOB_UID_LABEL))
                .is_some_and(|owner| owner == uid)
        })
        .find_map(|p| p.metadata.name)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn review_access(&self) -> Result<AccessReview, ClusterError> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let review = SelfSubjectAccessReview {
            metadata: ObjectMeta::default(),
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some("create".to_string()),
                    resource: Some("namespaces".to_string()),
                    ..Default::default()
                }),
                non_resource_attributes: None,
            },
            status: None,
        };

        let response = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| map_error(e, "selfsubjectaccessreview"))?;

        let allowed = response.status.map(|s| s.allowed).unwrap_or(false);
        debug!(allowed, "Namespace create access reviewed");
        Ok(AccessReview {
            can_create_namespaces: allowed,
        })
    }

    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, &format!("service {}/{}", namespace, name)))?;
        Ok(service.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<Ensured, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: managed_metadata(name, None),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(Ensured::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Ensured::AlreadyExisted),
            Err(e) => Err(map_error(e, &format!("namespace {}", name))),
        }
    }

    async fn ensure_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Ensured, ClusterError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = ServiceAccount {
            metadata: managed_metadata(name, Some(namespace)),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &account).await {
            Ok(_) => Ok(Ensured::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Ensured::AlreadyExisted),
            Err(e) => Err(map_error(e, &format!("serviceaccount {}/{}", namespace, name))),
        }
    }

    async fn bind_cluster_role(&self, grant: &RoleGrant) -> Result<Ensured, ClusterError> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let what = format!("clusterrolebinding {}", grant.binding_name);

        let existed = api
            .get_opt(&grant.binding_name)
            .await
            .map_err(|e| map_error(e, &what))?
            .is_some();

        let binding = ClusterRoleBinding {
            metadata: managed_metadata(&grant.binding_name, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: grant.cluster_role.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: grant.service_account.clone(),
                namespace: Some(grant.namespace.clone()),
                api_group: None,
            }]),
        };

        api.patch(
            &grant.binding_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&binding),
        )
        .await
        .map_err(|e| map_error(e, &what))?;

        Ok(if existed {
            Ensured::AlreadyExisted
        } else {
            Ensured::Created
        })
    }

    async fn mint_token(
        &self,
        namespace: &str,
        service_account: &str,
        validity: Duration,
    ) -> Result<String, ClusterError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            metadata: ObjectMeta::default(),
            spec: TokenRequestSpec {
                audiences: Vec::new(),
                expiration_seconds: Some(i64::try_from(validity.as_secs()).unwrap_or(i64::MAX)),
                bound_object_ref: None,
            },
            status: None,
        };
        let body = serde_json::to_vec(&request).map_err(|e| ClusterError::Invalid(e.to_string()))?;

        let response: TokenRequest = api
            .create_subresource("token", service_account, &PostParams::default(), body)
            .await
            .map_err(|e| {
                map_error(e, &format!("serviceaccount {}/{}", namespace, service_account))
            })?;

        Ok(response.status.map(|s| s.token).unwrap_or_default())
    }

    async fn resolve_route(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, ClusterError> {
        let gvk = GroupVersionKind::gvk("route.openshift.io", "v1", "Route");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        // A cluster without the Route API answers 404 like a missing route.
        let route = api
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, &format!("route {}/{}", namespace, name)))?;

        Ok(route.and_then(|r| {
            r.data
                .get("spec")
                .and_then(|spec| spec.get("host"))
                .and_then(|host| host.as_str())
                .map(str::to_string)
        }))
    }

    async fn annotate_service(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, &format!("service {}/{}", namespace, name)))?;
        Ok(())
    }

    async fn launch_workload(&self, spec: &WorkloadSpec) -> Result<(), ClusterError> {
        let what = spec.resource_ref().to_string();
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());

        let metadata = ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        };

        match spec.kind {
            ResourceKind::Pod => {
                let pod = Pod {
                    metadata,
                    spec: Some(pod_spec(spec)),
                    ..Default::default()
                };
                self.pods(&spec.namespace)
                    .create(&PostParams::default(), &pod)
                    .await
                    .map_err(|e| map_error(e, &what))?;
            }
            ResourceKind::Job => {
                let job = Job {
                    metadata,
                    spec: Some(JobSpec {
                        backoff_limit: Some(0),
                        ttl_seconds_after_finished: Some(600),
                        template: PodTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: Some(labels),
                                ..Default::default()
                            }),
                            spec: Some(pod_spec(spec)),
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                self.jobs(&spec.namespace)
                    .create(&PostParams::default(), &job)
                    .await
                    .map_err(|e| map_error(e, &what))?;
            }
        }

        debug!(workload = %what, "Workload created");
        Ok(())
    }

    async fn workload_phase(&self, workload: &ResourceRef) -> Result<WorkloadPhase, ClusterError> {
        let what = workload.to_string();
        match workload.kind {
            ResourceKind::Pod => {
                let pod = self
                    .pods(&workload.namespace)
                    .get_opt(&workload.name)
                    .await
                    .map_err(|e| map_error(e, &what))?;
                Ok(match pod {
                    None => WorkloadPhase::Missing,
                    Some(pod) => {
                        let phase = pod.status.and_then(|s| s.phase).unwrap_or_default();
                        match phase.as_str() {
                            "Running" => WorkloadPhase::Running,
                            "Succeeded" => WorkloadPhase::Succeeded,
                            "Failed" => WorkloadPhase::Failed,
                            _ => WorkloadPhase::Pending,
                        }
                    }
                })
            }
            ResourceKind::Job => {
                let job = self
                    .jobs(&workload.namespace)
                    .get_opt(&workload.name)
                    .await
                    .map_err(|e| map_error(e, &what))?;
                Ok(match job.map(|j| j.status.unwrap_or_default()) {
                    None => WorkloadPhase::Missing,
                    Some(status) if status.succeeded.unwrap_or(0) > 0 => WorkloadPhase::Succeeded,
                    Some(status) if status.failed.unwrap_or(0) > 0 => WorkloadPhase::Failed,
                    Some(status) if status.active.unwrap_or(0) > 0 => WorkloadPhase::Running,
                    Some(_) => WorkloadPhase::Pending,
                })
            }
        }
    }

    async fn workload_output(&self, workload: &ResourceRef) -> Result<String, ClusterError> {
        let what = workload.to_string();
        let pod_name = match workload.kind {
            ResourceKind::Pod => workload.name.clone(),
            ResourceKind::Job => self
                .first_job_pod(workload)
                .await?
                .ok_or_else(|| ClusterError::NotFound(format!("pod of {}", what)))?,
        };

        self.pods(&workload.namespace)
            .logs(&pod_name, &LogParams::default())
            .await
            .map_err(|e| map_error(e, &what))
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<(), ClusterError> {
        let what = resource.to_string();
        let result = match resource.kind {
            ResourceKind::Pod => self
                .pods(&resource.namespace)
                .delete(&resource.name, &DeleteParams::default())
                .await
                .map(|_| ()),
            ResourceKind::Job => self
                .jobs(&resource.namespace)
                .delete(&resource.name, &DeleteParams::background())
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_error(e, &what)),
        }
    }
}

fn managed_metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            FIELD_MANAGER.to_string(),
        )])),
        ..Default::default()
    }
}

/// Pod spec satisfying the OpenShift `restricted` security context constraint
fn pod_spec(spec: &WorkloadSpec) -> PodSpec {
    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    PodSpec {
        service_account_name: Some(spec.service_account.clone()),
        restart_policy: Some("Never".to_string()),
        containers: vec![Container {
            name: "probe".to_string(),
            image: Some(spec.image.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.script.clone(),
            ]),
            env: Some(env),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: None,
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    localhost_profile: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn map_error(err: kube::Error, what: &str) -> ClusterError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            401 => ClusterError::Unauthorized(ae.message),
            403 => ClusterError::Forbidden(ae.message),
            404 => ClusterError::NotFound(what.to_string()),
            409 => ClusterError::AlreadyExists(what.to_string()),
            code => ClusterError::Api(format!("{} ({}): {}", what, code, ae.message)),
        },
        kube::Error::HyperError(e) => ClusterError::Unreachable(e.to_string()),
        kube::Error::Service(e) => ClusterError::Unreachable(e.to_string()),
        other => ClusterError::Api(format!("{}: {}", what, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_map_error_codes() {
        assert!(matches!(
            map_error(api_error(401), "x"),
            ClusterError::Unauthorized(_)
        ));
        assert!(matches!(map_error(api_error(403), "x"), ClusterError::Forbidden(_)));
        assert_eq!(
            map_error(api_error(409), "namespace a"),
            ClusterError::AlreadyExists("namespace a".to_string())
        );
        assert!(matches!(map_error(api_error(500), "x"), ClusterError::Api(_)));
    }

    fn job_pod(name: &str, uid: &str, terminating: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([
                    ("job-name".to_string(), "prometheus-metrics-verify".to_string()),
                    (JOB_UID_LABEL.to_string(), uid.to_string()),
                ])),
                deletion_timestamp: terminating.then(|| {
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_job_output_ignores_previous_run_pod() {
        assert_eq!(job_pod_selector("uid-2"), "controller-uid=uid-2");

        let pods = vec![
            job_pod("prometheus-metrics-verify-old", "uid-1", false),
            job_pod("prometheus-metrics-verify-new", "uid-2", false),
        ];
        assert_eq!(
            select_job_pod(pods, "uid-2").as_deref(),
            Some("prometheus-metrics-verify-new")
        );

        let pods = vec![
            job_pod("prometheus-metrics-verify-gone", "uid-2", true),
            job_pod("prometheus-metrics-verify-old", "uid-1", false),
        ];
        assert_eq!(select_job_pod(pods, "uid-2"), None);
    }

    #[test]
    fn test_pod_spec_is_restricted() {
        let spec = WorkloadSpec {
            kind: ResourceKind::Pod,
            name: "probe".to_string(),
            namespace: "ns".to_string(),
            service_account: "sa".to_string(),
            image: "ubi".to_string(),
            script: "echo hi".to_string(),
            env: BTreeMap::from([("TOKEN".to_string(), "t".to_string())]),
            labels: BTreeMap::new(),
        };
        let pod = pod_spec(&spec);
        assert_eq!(pod.service_account_name.as_deref(), Some("sa"));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let container = &pod.containers[0];
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.allow_privilege_escalation, Some(false));
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(container.env.as_ref().unwrap()[0].name, "TOKEN");
    }
}
