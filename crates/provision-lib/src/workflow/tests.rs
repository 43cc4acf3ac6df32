use super::*;
use crate::cluster::InMemoryCluster;
use crate::models::WorkloadPhase;
use crate::report::{RunStatus, StepStatus};
use crate::wait::ManualClock;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

const MONITORING_NS: &str = "openshift-monitoring";
const PROMETHEUS: &str = "prometheus-k8s";
const PROBE_POD: &str = "prometheus-connectivity-test";
const VERIFY_JOB: &str = "prometheus-metrics-verify";

fn test_config(dir: &TempDir) -> ProvisionConfig {
    ProvisionConfig {
        output_dir: dir.path().to_path_buf(),
        ..ProvisionConfig::default()
    }
}

/// A cluster where every probe succeeds
fn healthy_cluster() -> InMemoryCluster {
    InMemoryCluster::new()
        .with_service(MONITORING_NS, PROMETHEUS)
        .with_workload(PROBE_POD, WorkloadPhase::Succeeded, "200")
        .with_workload(VERIFY_JOB, WorkloadPhase::Succeeded, "SUCCESS\n")
}

fn provisioner(cluster: &Arc<InMemoryCluster>, config: ProvisionConfig) -> Provisioner {
    Provisioner::new(cluster.clone(), config).with_clock(Arc::new(ManualClock::new()))
}

fn status_of(report: &RunReport, step: Step) -> StepStatus {
    report
        .outcome(step)
        .map(|o| o.status)
        .unwrap_or_else(|| panic!("no outcome for {:?}", step))
}

#[tokio::test]
async fn test_fresh_cluster_completes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(
        healthy_cluster().with_route(MONITORING_NS, PROMETHEUS, "prometheus-k8s.apps.example.com"),
    );

    let report = provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed, "{:#?}", report.steps);
    assert_eq!(report.steps.len(), Step::ALL.len());
    let order: Vec<Step> = report.steps.iter().map(|o| o.step).collect();
    assert_eq!(order, Step::ALL.to_vec());

    assert_eq!(cluster.namespaces(), vec!["dynatrace-monitoring".to_string()]);
    assert_eq!(
        cluster.service_accounts(),
        vec![(
            "dynatrace-monitoring".to_string(),
            "dynatrace-prometheus".to_string()
        )]
    );
    let bindings = cluster.role_bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].cluster_role, "cluster-monitoring-view");

    let endpoints = report.endpoints.clone().unwrap();
    assert_eq!(
        endpoints.external.as_deref(),
        Some("https://prometheus-k8s.apps.example.com")
    );
    assert!(report.artifacts.agent_config_file.is_some());
    assert!(report.artifacts.queries_file.is_some());
    assert!(cluster.live_workloads().is_empty());
}

#[tokio::test]
async fn test_token_file_holds_minted_token() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().with_token("eyJhbGciOiJSUzI1NiJ9.payload.sig"));
    let config = test_config(&dir);
    let token_path = config.token_path();

    provisioner(&cluster, config).run().await.unwrap();

    assert_eq!(
        fs::read_to_string(token_path).unwrap(),
        "eyJhbGciOiJSUzI1NiJ9.payload.sig"
    );
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());

    let first = provisioner(&cluster, test_config(&dir)).run().await.unwrap();
    let second = provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(cluster.namespaces().len(), 1);
    assert_eq!(cluster.service_accounts().len(), 1);
    assert_eq!(cluster.role_bindings().len(), 1);

    for step in [Step::Namespace, Step::ServiceAccount, Step::RoleBinding] {
        let message = &second.outcome(step).unwrap().message;
        assert!(message.contains("already exists"), "{}: {}", step, message);
    }

    // every run mints a fresh token and rewrites the file with it
    let tokens = cluster.minted_tokens();
    assert_eq!(tokens.len(), 2);
    let written = fs::read_to_string(test_config(&dir).token_path()).unwrap();
    assert_eq!(written, tokens[1]);
}

#[tokio::test]
async fn test_unauthenticated_session_aborts_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().unauthenticated());
    let config = test_config(&dir);
    let token_path = config.token_path();

    let err = provisioner(&cluster, config).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::Unauthenticated(_)));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(cluster.mutation_count(), 0);
    assert!(cluster.minted_tokens().is_empty());
    assert!(!token_path.exists());
}

#[tokio::test]
async fn test_unreachable_cluster_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().unreachable());

    let err = provisioner(&cluster, test_config(&dir)).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::SessionUnavailable(_)));
    assert_eq!(cluster.mutation_count(), 0);
}

#[tokio::test]
async fn test_missing_privilege_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().without_privilege());

    let err = provisioner(&cluster, test_config(&dir)).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::InsufficientPrivilege));
    assert!(cluster.namespaces().is_empty());
}

#[tokio::test]
async fn test_token_request_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(
        healthy_cluster().with_token_error(ClusterError::Forbidden("tokenrequests".to_string())),
    );
    let config = test_config(&dir);
    let agent_config = config.agent_config_path();

    let err = provisioner(&cluster, config).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::TokenRequest { .. }));
    assert!(!agent_config.exists());
    assert!(cluster.live_workloads().is_empty());
    assert!(cluster.delete_requests().is_empty());
}

#[tokio::test]
async fn test_empty_token_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().with_token("  \n"));
    let config = test_config(&dir);
    let token_path = config.token_path();

    let err = provisioner(&cluster, config).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::EmptyToken(_)));
    assert!(!token_path.exists());
}

#[tokio::test]
async fn test_unwritable_token_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    fs::write(&blocker, "x").unwrap();
    let cluster = Arc::new(healthy_cluster());
    let config = ProvisionConfig {
        output_dir: blocker,
        ..ProvisionConfig::default()
    };

    let err = provisioner(&cluster, config).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::Artifact { .. }));
}

#[tokio::test]
async fn test_endpoints_without_route() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());
    let config = test_config(&dir);
    let endpoints_path = config.endpoints_path();

    let report = provisioner(&cluster, config).run().await.unwrap();

    assert_eq!(status_of(&report, Step::Endpoints), StepStatus::Succeeded);
    let descriptor = fs::read_to_string(endpoints_path).unwrap();
    assert!(descriptor.contains("Internal: https://prometheus-k8s.openshift-monitoring.svc:9091"));
    assert!(!descriptor.contains("External:"));
}

#[tokio::test]
async fn test_probe_without_response_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(
        InMemoryCluster::new()
            .with_service(MONITORING_NS, PROMETHEUS)
            .with_workload(PROBE_POD, WorkloadPhase::Succeeded, "000")
            .with_workload(VERIFY_JOB, WorkloadPhase::Succeeded, "FAILED"),
    );

    let report = provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithWarnings);
    assert_eq!(status_of(&report, Step::ConnectivityProbe), StepStatus::Warned);
    assert!(report
        .outcome(Step::ConnectivityProbe)
        .unwrap()
        .message
        .contains("000"));
    assert_eq!(status_of(&report, Step::MetricVerification), StepStatus::Warned);
    // later steps still ran
    assert_eq!(status_of(&report, Step::Artifacts), StepStatus::Succeeded);
}

#[tokio::test]
async fn test_forbidden_probe_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(
        healthy_cluster().with_workload(PROBE_POD, WorkloadPhase::Succeeded, "403"),
    );

    let report = provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    let probe = report.outcome(Step::ConnectivityProbe).unwrap();
    assert_eq!(probe.status, StepStatus::Warned);
    assert!(probe.message.contains("HTTP 403"));
}

#[tokio::test]
async fn test_probe_workloads_removed_even_when_deletes_fail() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().with_failing_deletes());

    let report = provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let deleted: Vec<String> = cluster
        .delete_requests()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(deleted, vec![PROBE_POD.to_string(), VERIFY_JOB.to_string()]);
}

#[tokio::test]
async fn test_stuck_verification_job_waits_for_settle_time() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(
        InMemoryCluster::new()
            .with_service(MONITORING_NS, PROMETHEUS)
            .with_workload(PROBE_POD, WorkloadPhase::Succeeded, "200")
            .with_workload(VERIFY_JOB, WorkloadPhase::Succeeded, "")
            .with_stuck_workload(VERIFY_JOB),
    );
    let clock = Arc::new(ManualClock::new());

    let report = Provisioner::new(cluster.clone(), test_config(&dir))
        .with_clock(clock.clone())
        .run()
        .await
        .unwrap();

    let verification = report.outcome(Step::MetricVerification).unwrap();
    assert_eq!(verification.status, StepStatus::Warned);
    assert!(verification.message.contains("no result"), "{}", verification.message);
    assert_eq!(clock.elapsed(), Duration::from_secs(30));
    assert!(cluster.live_workloads().is_empty());
}

#[tokio::test]
async fn test_marker_read_after_settle_time_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster().with_stuck_workload(VERIFY_JOB));
    let clock = Arc::new(ManualClock::new());

    let report = Provisioner::new(cluster.clone(), test_config(&dir))
        .with_clock(clock.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(
        status_of(&report, Step::MetricVerification),
        StepStatus::Succeeded
    );
    assert_eq!(clock.elapsed(), Duration::from_secs(30));
}

#[tokio::test]
async fn test_missing_monitoring_stack_warns() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(
        InMemoryCluster::new()
            .with_workload(PROBE_POD, WorkloadPhase::Succeeded, "200")
            .with_workload(VERIFY_JOB, WorkloadPhase::Succeeded, "SUCCESS"),
    );

    let report = provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    let preconditions = report.outcome(Step::Preconditions).unwrap();
    assert_eq!(preconditions.status, StepStatus::Warned);
    assert_eq!(preconditions.warnings.len(), 1);
    assert_eq!(status_of(&report, Step::ServiceAnnotation), StepStatus::Warned);
    assert_eq!(status_of(&report, Step::Token), StepStatus::Succeeded);
}

#[tokio::test]
async fn test_service_annotated_for_scraping() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());

    provisioner(&cluster, test_config(&dir)).run().await.unwrap();

    let annotations = cluster.service_annotations(MONITORING_NS, PROMETHEUS);
    assert_eq!(annotations["metrics.dynatrace.com/scrape"], "true");
    assert_eq!(annotations["metrics.dynatrace.com/port"], "9091");
}

#[tokio::test]
async fn test_annotation_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());
    let config = ProvisionConfig {
        annotate_service: false,
        ..test_config(&dir)
    };

    let report = provisioner(&cluster, config).run().await.unwrap();

    assert_eq!(status_of(&report, Step::ServiceAnnotation), StepStatus::Skipped);
    assert!(cluster.service_annotations(MONITORING_NS, PROMETHEUS).is_empty());
}

#[tokio::test]
async fn test_skip_probes() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(InMemoryCluster::new().with_service(MONITORING_NS, PROMETHEUS));

    let report = provisioner(&cluster, test_config(&dir))
        .skip_probes(true)
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(status_of(&report, Step::ConnectivityProbe), StepStatus::Skipped);
    assert_eq!(status_of(&report, Step::MetricVerification), StepStatus::Skipped);
    assert!(cluster.delete_requests().is_empty());
}

#[tokio::test]
async fn test_observer_sees_every_step() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    provisioner(&cluster, test_config(&dir))
        .with_observer(move |outcome| sink.lock().unwrap().push(outcome.step))
        .run()
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), Step::ALL.to_vec());
}

#[tokio::test]
async fn test_verify_runs_only_probes() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());
    cluster.ensure_namespace("dynatrace-monitoring").await.unwrap();
    let config = test_config(&dir);
    let endpoints_path = config.endpoints_path();

    let report = provisioner(&cluster, config).verify("existing-token").await.unwrap();

    let order: Vec<Step> = report.steps.iter().map(|o| o.step).collect();
    assert_eq!(
        order,
        vec![
            Step::Preconditions,
            Step::Endpoints,
            Step::ConnectivityProbe,
            Step::MetricVerification
        ]
    );
    assert_eq!(report.status, RunStatus::Completed);
    assert!(cluster.minted_tokens().is_empty());
    assert!(!endpoints_path.exists());
}

#[tokio::test]
async fn test_verify_rejects_empty_token() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());

    let err = provisioner(&cluster, test_config(&dir)).verify("").await.unwrap_err();

    assert!(matches!(err, ProvisionError::EmptyToken(_)));
}

#[tokio::test]
async fn test_invalid_config_rejected_before_cluster_calls() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());
    let config = ProvisionConfig {
        namespace: "Not_A_Namespace".to_string(),
        ..test_config(&dir)
    };

    let err = provisioner(&cluster, config).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::Config(_)));
    assert_eq!(cluster.mutation_count(), 0);
}

#[tokio::test]
async fn test_oversized_ready_timeout_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(healthy_cluster());
    let mut config = test_config(&dir);
    config.probe.ready_timeout_secs = u64::MAX;

    let err = provisioner(&cluster, config).run().await.unwrap_err();

    assert!(matches!(err, ProvisionError::Config(_)));
    assert_eq!(cluster.mutation_count(), 0);
}
