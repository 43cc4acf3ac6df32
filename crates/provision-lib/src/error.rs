//! Error types for the provisioning workflow
//!
//! `ClusterError` describes what went wrong talking to the control plane.
//! `ProvisionError` is the fatal class: any value of it aborts the run.

use thiserror::Error;

pub use crate::cluster::ClusterError;

/// Fatal errors that abort the workflow with a non-zero exit
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("cluster session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("cluster session is not authenticated: {0}")]
    Unauthenticated(String),

    #[error("insufficient privilege: the current identity cannot create namespaces")]
    InsufficientPrivilege,

    #[error("token request for service account {service_account} failed: {source}")]
    TokenRequest {
        service_account: String,
        #[source]
        source: ClusterError,
    },

    #[error("token request for service account {0} returned an empty token")]
    EmptyToken(String),

    #[error("failed to write {path}: {source}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// True when the run aborted before any cluster resource was touched
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ProvisionError::SessionUnavailable(_)
                | ProvisionError::Unauthenticated(_)
                | ProvisionError::InsufficientPrivilege
                | ProvisionError::Config(_)
        )
    }
}

impl From<config::ConfigError> for ProvisionError {
    fn from(err: config::ConfigError) -> Self {
        ProvisionError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(ProvisionError::InsufficientPrivilege.is_precondition());
        assert!(ProvisionError::Unauthenticated("401".into()).is_precondition());
        assert!(!ProvisionError::EmptyToken("sa".into()).is_precondition());
        assert_eq!(ProvisionError::EmptyToken("sa".into()).exit_code(), 1);
    }

    #[test]
    fn test_token_request_message_names_account() {
        let err = ProvisionError::TokenRequest {
            service_account: "dynatrace-prometheus".into(),
            source: ClusterError::Forbidden("no".into()),
        };
        assert!(err.to_string().contains("dynatrace-prometheus"));
    }
}
