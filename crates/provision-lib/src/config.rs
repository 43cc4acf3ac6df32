//! Provisioning configuration
//!
//! Every resource name the workflow touches lives here so callers (and tests)
//! can inject their own. Values are layered: defaults, then an optional file,
//! then `DTP_*` environment variables. The CLI applies flag overrides last.

use crate::error::ProvisionError;
use crate::models::RoleGrant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`DTP_NAMESPACE`, `DTP_PROBE__IMAGE`, ...)
pub const ENV_PREFIX: &str = "DTP";

/// Kubernetes refuses token requests shorter than ten minutes
const MIN_TOKEN_DURATION_SECS: u64 = 600;

/// Longest accepted probe timeout, settle time or poll interval
const MAX_PROBE_WAIT_SECS: u64 = 24 * 3600;

/// Annotation keys understood by the Dynatrace Prometheus scraper
pub mod annotations {
    pub const SCRAPE: &str = "metrics.dynatrace.com/scrape";
    pub const PORT: &str = "metrics.dynatrace.com/port";
    pub const SECURE: &str = "metrics.dynatrace.com/secure";
    pub const PATH: &str = "metrics.dynatrace.com/path";
}

/// Provisioning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Namespace holding the service account and probe workloads
    pub namespace: String,
    /// Service account used to query metrics
    pub service_account: String,
    /// Pre-existing read-only monitoring role
    pub cluster_role: String,
    /// ClusterRoleBinding name (derived from account and role when unset)
    pub role_binding: Option<String>,
    /// Validity of the minted token in seconds (one year by default)
    pub token_duration_secs: u64,

    /// Namespace of the cluster monitoring stack
    pub monitoring_namespace: String,
    /// Prometheus service name
    pub prometheus_service: String,
    /// Route exposing the Prometheus service outside the cluster
    pub prometheus_route: String,
    /// Prometheus query API port
    pub prometheus_port: u16,

    /// Directory receiving all generated files
    pub output_dir: PathBuf,
    pub token_file: String,
    pub endpoints_file: String,
    pub agent_config_file: String,
    pub queries_file: String,

    /// Annotate the Prometheus service for scraping
    pub annotate_service: bool,
    /// Path advertised in the scrape annotations
    pub scrape_path: String,

    pub probe: ProbeConfig,
}

/// Settings for the connectivity probe and metric verification workloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Image providing `/bin/sh`, `curl` and `grep`
    pub image: String,
    pub pod_name: String,
    pub job_name: String,
    /// Upper bound on waiting for the probe pod to finish
    pub ready_timeout_secs: u64,
    /// Interval between phase checks
    pub poll_interval_secs: u64,
    /// Upper bound on waiting for the verification job before reading its output
    pub settle_secs: u64,
    /// PromQL expression used by the connectivity probe
    pub query: String,
    /// Metric whose presence the verification job checks
    pub metric: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            namespace: "dynatrace-monitoring".to_string(),
            service_account: "dynatrace-prometheus".to_string(),
            cluster_role: "cluster-monitoring-view".to_string(),
            role_binding: None,
            token_duration_secs: 8760 * 3600,
            monitoring_namespace: "openshift-monitoring".to_string(),
            prometheus_service: "prometheus-k8s".to_string(),
            prometheus_route: "prometheus-k8s".to_string(),
            prometheus_port: 9091,
            output_dir: PathBuf::from("."),
            token_file: "dynatrace-prometheus-token.txt".to_string(),
            endpoints_file: "prometheus-endpoints.txt".to_string(),
            agent_config_file: "dynatrace-prometheus-config.yaml".to_string(),
            queries_file: "dynatrace-example-queries.md".to_string(),
            annotate_service: true,
            scrape_path: "/metrics".to_string(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            image: "registry.access.redhat.com/ubi9/ubi-minimal:latest".to_string(),
            pod_name: "prometheus-connectivity-test".to_string(),
            job_name: "prometheus-metrics-verify".to_string(),
            ready_timeout_secs: 60,
            poll_interval_secs: 2,
            settle_secs: 30,
            query: "up".to_string(),
            metric: "cluster_operator_up".to_string(),
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from an optional file and the `DTP_*` environment
    pub fn load(path: Option<&Path>) -> Result<Self, ProvisionError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load configuration using a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self, ProvisionError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check names, ports and durations
    pub fn validate(&self) -> Result<(), ProvisionError> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("service_account", &self.service_account),
            ("monitoring_namespace", &self.monitoring_namespace),
            ("prometheus_service", &self.prometheus_service),
            ("probe.pod_name", &self.probe.pod_name),
            ("probe.job_name", &self.probe.job_name),
        ] {
            if !is_dns_label(value) {
                return Err(ProvisionError::Config(format!(
                    "{} '{}' is not a valid DNS-1123 label",
                    field, value
                )));
            }
        }

        if let Some(binding) = &self.role_binding {
            if !is_dns_subdomain(binding) {
                return Err(ProvisionError::Config(format!(
                    "role_binding '{}' is not a valid DNS-1123 subdomain",
                    binding
                )));
            }
        }
        if self.cluster_role.trim().is_empty() {
            return Err(ProvisionError::Config("cluster_role must not be empty".into()));
        }
        if self.prometheus_port == 0 {
            return Err(ProvisionError::Config("prometheus_port must not be 0".into()));
        }
        if self.token_duration_secs < MIN_TOKEN_DURATION_SECS {
            return Err(ProvisionError::Config(format!(
                "token_duration_secs must be at least {}",
                MIN_TOKEN_DURATION_SECS
            )));
        }
        if self.probe.ready_timeout_secs == 0
            || self.probe.poll_interval_secs == 0
            || self.probe.settle_secs == 0
        {
            return Err(ProvisionError::Config("probe timings must be non-zero".into()));
        }
        for (field, value) in [
            ("probe.ready_timeout_secs", self.probe.ready_timeout_secs),
            ("probe.poll_interval_secs", self.probe.poll_interval_secs),
            ("probe.settle_secs", self.probe.settle_secs),
        ] {
            if value > MAX_PROBE_WAIT_SECS {
                return Err(ProvisionError::Config(format!(
                    "{} must be at most {}",
                    field, MAX_PROBE_WAIT_SECS
                )));
            }
        }
        if self.probe.metric.trim().is_empty() {
            return Err(ProvisionError::Config("probe.metric must not be empty".into()));
        }
        for (field, value) in [
            ("token_file", &self.token_file),
            ("endpoints_file", &self.endpoints_file),
            ("agent_config_file", &self.agent_config_file),
            ("queries_file", &self.queries_file),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::Config(format!("{} must not be empty", field)));
            }
        }

        Ok(())
    }

    /// Well-known in-cluster URL of the Prometheus query API
    pub fn internal_url(&self) -> String {
        format!(
            "https://{}.{}.svc:{}",
            self.prometheus_service, self.monitoring_namespace, self.prometheus_port
        )
    }

    pub fn role_grant(&self) -> RoleGrant {
        RoleGrant {
            binding_name: self
                .role_binding
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.service_account, self.cluster_role)),
            cluster_role: self.cluster_role.clone(),
            namespace: self.namespace.clone(),
            service_account: self.service_account.clone(),
        }
    }

    pub fn token_duration(&self) -> Duration {
        Duration::from_secs(self.token_duration_secs)
    }

    pub fn token_path(&self) -> PathBuf {
        self.output_dir.join(&self.token_file)
    }

    pub fn endpoints_path(&self) -> PathBuf {
        self.output_dir.join(&self.endpoints_file)
    }

    pub fn agent_config_path(&self) -> PathBuf {
        self.output_dir.join(&self.agent_config_file)
    }

    pub fn queries_path(&self) -> PathBuf {
        self.output_dir.join(&self.queries_file)
    }

    /// Annotations merged onto the Prometheus service
    pub fn scrape_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (annotations::SCRAPE.to_string(), "true".to_string()),
            (annotations::PORT.to_string(), self.prometheus_port.to_string()),
            (annotations::SECURE.to_string(), "true".to_string()),
            (annotations::PATH.to_string(), self.scrape_path.clone()),
        ])
    }
}

impl ProbeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 characters
fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// RFC 1123 subdomain: dot-separated labels, at most 253 characters
fn is_dns_subdomain(value: &str) -> bool {
    value.len() <= 253 && value.split('.').all(is_dns_label)
}
