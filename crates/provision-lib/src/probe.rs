//! Probe workloads run inside the cluster
//!
//! The connectivity probe prints the HTTP status of an authenticated query
//! against the internal Prometheus endpoint. The verification job greps the
//! query result for a known metric and prints `SUCCESS` or `FAILED`.

use crate::cluster::{ClusterClient, ClusterError};
use crate::config::ProvisionConfig;
use crate::models::{ResourceKind, WorkloadPhase, WorkloadRun, WorkloadSpec};
use crate::wait::{wait_until, Clock, WaitPolicy};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const SUCCESS_MARKER: &str = "SUCCESS";
pub const FAILED_MARKER: &str = "FAILED";

/// Status reported when no HTTP response was received at all
pub const NO_RESPONSE_STATUS: &str = "000";

const TOKEN_ENV: &str = "PROMETHEUS_TOKEN";
const URL_ENV: &str = "PROMETHEUS_URL";
const QUERY_ENV: &str = "PROMETHEUS_QUERY";
const METRIC_ENV: &str = "PROMETHEUS_METRIC";

const PROBE_SCRIPT: &str = r#"curl -sk -G -o /dev/null -w '%{http_code}' -H "Authorization: Bearer ${PROMETHEUS_TOKEN}" --data-urlencode "query=${PROMETHEUS_QUERY}" "${PROMETHEUS_URL}/api/v1/query" || true"#;

const VERIFY_SCRIPT: &str = r#"if curl -sk -G -H "Authorization: Bearer ${PROMETHEUS_TOKEN}" --data-urlencode "query=${PROMETHEUS_METRIC}" "${PROMETHEUS_URL}/api/v1/query" | grep -q "${PROMETHEUS_METRIC}"; then echo SUCCESS; else echo FAILED; fi"#;

fn base_env(config: &ProvisionConfig, token: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TOKEN_ENV.to_string(), token.to_string()),
        (URL_ENV.to_string(), config.internal_url()),
    ])
}

fn probe_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "dtp-probe".to_string()),
        ("app.kubernetes.io/component".to_string(), component.to_string()),
    ])
}

/// Pod that prints the HTTP status of an authenticated query
pub fn connectivity_probe_spec(config: &ProvisionConfig, token: &str) -> WorkloadSpec {
    let mut env = base_env(config, token);
    env.insert(QUERY_ENV.to_string(), config.probe.query.clone());

    WorkloadSpec {
        kind: ResourceKind::Pod,
        name: config.probe.pod_name.clone(),
        namespace: config.namespace.clone(),
        service_account: config.service_account.clone(),
        image: config.probe.image.clone(),
        script: PROBE_SCRIPT.to_string(),
        env,
        labels: probe_labels("connectivity"),
    }
}

/// Job that prints `SUCCESS` when the metric appears in the query result
pub fn metric_verification_spec(config: &ProvisionConfig, token: &str) -> WorkloadSpec {
    let mut env = base_env(config, token);
    env.insert(METRIC_ENV.to_string(), config.probe.metric.clone());

    WorkloadSpec {
        kind: ResourceKind::Job,
        name: config.probe.job_name.clone(),
        namespace: config.namespace.clone(),
        service_account: config.service_account.clone(),
        image: config.probe.image.clone(),
        script: VERIFY_SCRIPT.to_string(),
        env,
        labels: probe_labels("verification"),
    }
}

/// HTTP status printed by the connectivity probe; `000` when absent
pub fn parse_status_code(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .filter(|line| line.len() == 3 && line.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(NO_RESPONSE_STATUS)
        .to_string()
}

/// Marker printed by the verification job
pub fn parse_marker(output: &str) -> Option<bool> {
    output.lines().map(str::trim).find_map(|line| match line {
        SUCCESS_MARKER => Some(true),
        FAILED_MARKER => Some(false),
        _ => None,
    })
}

/// Launch a workload, wait for it to finish, capture its output and delete it.
///
/// Deletion is attempted whatever happened before it; a failed delete is
/// logged and swallowed. Only a failed launch is returned as an error.
pub async fn run_ephemeral_workload(
    cluster: &dyn ClusterClient,
    clock: &dyn Clock,
    spec: &WorkloadSpec,
    policy: WaitPolicy,
) -> Result<WorkloadRun, ClusterError> {
    let workload = spec.resource_ref();
    let result = execute(cluster, clock, spec, policy).await;

    if let Err(e) = cluster.delete_resource(&workload).await {
        warn!(workload = %workload, error = %e, "Failed to delete probe workload");
    } else {
        debug!(workload = %workload, "Probe workload deleted");
    }

    result
}

async fn execute(
    cluster: &dyn ClusterClient,
    clock: &dyn Clock,
    spec: &WorkloadSpec,
    policy: WaitPolicy,
) -> Result<WorkloadRun, ClusterError> {
    let workload = spec.resource_ref();
    cluster.launch_workload(spec).await?;

    let outcome = wait_until(clock, policy, || {
        let workload = &workload;
        async move {
            match cluster.workload_phase(workload).await {
                Ok(phase) if phase.is_terminal() => Some(phase),
                Ok(phase) => {
                    debug!(workload = %workload, phase = %phase, "Waiting for workload");
                    None
                }
                Err(e) => {
                    debug!(workload = %workload, error = %e, "Phase check failed");
                    None
                }
            }
        }
    })
    .await;

    let finished = outcome.is_ready();
    let phase = match outcome.ready() {
        Some(phase) => phase,
        None => cluster
            .workload_phase(&workload)
            .await
            .unwrap_or(WorkloadPhase::Pending),
    };

    let output = match cluster.workload_output(&workload).await {
        Ok(output) => output,
        Err(e) => {
            debug!(workload = %workload, error = %e, "No workload output");
            String::new()
        }
    };

    Ok(WorkloadRun {
        phase,
        finished,
        output,
    })
}
