//! Provisioning library for the Dynatrace Prometheus integration
//!
//! This crate provides the core functionality for:
//! - Loading and validating the provisioning configuration
//! - Talking to the cluster control plane through a narrow client trait
//! - Bounded waiting with an injectable clock
//! - Connectivity and metric-presence probe workloads
//! - Writing the token, endpoint and configuration artifacts
//! - Running the linear provisioning workflow and reporting its outcome

pub mod artifacts;
pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod probe;
pub mod report;
pub mod wait;
pub mod workflow;

pub use cluster::{ClusterClient, ClusterError, InMemoryCluster, KubeCluster};
pub use config::ProvisionConfig;
pub use error::ProvisionError;
pub use models::*;
pub use observability::{init_tracing, LogFormat, RunLogger};
pub use report::{RunReport, RunStatus, Step, StepOutcome, StepStatus};
pub use wait::{Clock, ManualClock, SystemClock};
pub use workflow::Provisioner;
