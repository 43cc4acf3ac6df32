//! Cluster control-plane access
//!
//! The workflow talks to the cluster only through [`ClusterClient`]. Two
//! implementations are provided: [`KubeCluster`] backed by the Kubernetes API
//! and [`InMemoryCluster`] which keeps all state in process.

mod live;
mod memory;

pub use live::KubeCluster;
pub use memory::InMemoryCluster;

use crate::models::{
    AccessReview, Ensured, ResourceRef, RoleGrant, WorkloadPhase, WorkloadSpec,
};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

pub use async_trait::async_trait;

/// Errors returned by cluster operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("API server unreachable: {0}")]
    Unreachable(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// Narrow capability over the cluster control plane
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Check the session is authenticated and what it may do
    async fn review_access(&self) -> Result<AccessReview, ClusterError>;

    /// True when the named service exists
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    /// Create the namespace unless it already exists
    async fn ensure_namespace(&self, name: &str) -> Result<Ensured, ClusterError>;

    /// Create the service account unless it already exists
    async fn ensure_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Ensured, ClusterError>;

    /// Bind a pre-existing cluster role to a service account; safe to repeat
    async fn bind_cluster_role(&self, grant: &RoleGrant) -> Result<Ensured, ClusterError>;

    /// Request a bearer token for the service account
    async fn mint_token(
        &self,
        namespace: &str,
        service_account: &str,
        validity: Duration,
    ) -> Result<String, ClusterError>;

    /// Host of the externally reachable route, if one exists
    async fn resolve_route(&self, namespace: &str, name: &str)
        -> Result<Option<String>, ClusterError>;

    /// Merge annotations onto a service
    async fn annotate_service(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Create an ephemeral workload
    async fn launch_workload(&self, spec: &WorkloadSpec) -> Result<(), ClusterError>;

    /// Current phase of a workload
    async fn workload_phase(&self, workload: &ResourceRef) -> Result<WorkloadPhase, ClusterError>;

    /// Captured stdout of a workload
    async fn workload_output(&self, workload: &ResourceRef) -> Result<String, ClusterError>;

    /// Delete a workload; deleting a missing resource succeeds
    async fn delete_resource(&self, resource: &ResourceRef) -> Result<(), ClusterError>;
}
