//! The provisioning workflow
//!
//! A strictly linear pipeline. Only precondition failures and token failures
//! abort a run; every other anomaly is recorded as a warning and the next step
//! runs.

#[cfg(test)]
mod tests;

use crate::artifacts;
use crate::cluster::{ClusterClient, ClusterError};
use crate::config::ProvisionConfig;
use crate::error::ProvisionError;
use crate::models::EndpointDescriptor;
use crate::observability::RunLogger;
use crate::probe::{self, NO_RESPONSE_STATUS};
use crate::report::{ReportBuilder, RunReport, Step, StepOutcome};
use crate::wait::{Clock, SystemClock, WaitPolicy};
use std::sync::Arc;

/// Callback invoked after every step
pub type StepObserver = Box<dyn Fn(&StepOutcome) + Send + Sync>;

/// Runs the provisioning workflow against a cluster
pub struct Provisioner {
    cluster: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    config: ProvisionConfig,
    logger: RunLogger,
    observer: Option<StepObserver>,
    skip_probes: bool,
}

impl Provisioner {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: ProvisionConfig) -> Self {
        let logger = RunLogger::new(&config.namespace, &config.service_account);
        Self {
            cluster,
            clock: Arc::new(SystemClock),
            config,
            logger,
            observer: None,
            skip_probes: false,
        }
    }

    /// Replace the clock used for all waits
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receive every step outcome as soon as it is known
    pub fn with_observer(mut self, observer: impl Fn(&StepOutcome) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Skip the connectivity probe and metric verification
    pub fn skip_probes(mut self, skip: bool) -> Self {
        self.skip_probes = skip;
        self
    }

    /// Run the full pipeline
    pub async fn run(&self) -> Result<RunReport, ProvisionError> {
        self.config.validate()?;
        self.logger.log_run_started("setup");
        let mut report = ReportBuilder::new();

        let preconditions = self
            .check_preconditions(true)
            .await
            .map_err(|e| self.abort(Step::Preconditions, e))?;
        self.record(&mut report, preconditions);

        let namespace = self.ensure_namespace().await;
        self.record(&mut report, namespace);

        let service_account = self.ensure_service_account().await;
        self.record(&mut report, service_account);

        let role = self.grant_role().await;
        self.record(&mut report, role);

        let token = self
            .mint_token(&mut report)
            .await
            .map_err(|e| self.abort(Step::Token, e))?;

        let endpoints = self.resolve_endpoints(&mut report, true).await;

        let annotation = self.annotate_service().await;
        self.record(&mut report, annotation);

        self.run_probes(&mut report, &token).await;

        let generated = self.generate_artifacts(&mut report, &endpoints, &token);
        self.record(&mut report, generated);

        let report = report.finish();
        self.logger.log_run_finished(&report);
        Ok(report)
    }

    /// Run only the probes with an existing token
    pub async fn verify(&self, token: &str) -> Result<RunReport, ProvisionError> {
        self.config.validate()?;
        if token.trim().is_empty() {
            return Err(self.abort(
                Step::Token,
                ProvisionError::EmptyToken(self.config.service_account.clone()),
            ));
        }

        self.logger.log_run_started("verify");
        let mut report = ReportBuilder::new();

        let preconditions = self
            .check_preconditions(false)
            .await
            .map_err(|e| self.abort(Step::Preconditions, e))?;
        self.record(&mut report, preconditions);

        self.resolve_endpoints(&mut report, false).await;
        self.run_probes(&mut report, token).await;

        let report = report.finish();
        self.logger.log_run_finished(&report);
        Ok(report)
    }

    fn record(&self, report: &mut ReportBuilder, outcome: StepOutcome) {
        self.logger.log_step(&outcome);
        if let Some(observer) = &self.observer {
            observer(&outcome);
        }
        report.push(outcome);
    }

    fn abort(&self, step: Step, err: ProvisionError) -> ProvisionError {
        self.logger.log_run_aborted(step, &err.to_string());
        err
    }

    async fn check_preconditions(
        &self,
        require_privilege: bool,
    ) -> Result<StepOutcome, ProvisionError> {
        let access = match self.cluster.review_access().await {
            Ok(access) => access,
            // Only anonymous callers are refused a self access review.
            Err(ClusterError::Unauthorized(msg)) | Err(ClusterError::Forbidden(msg)) => {
                return Err(ProvisionError::Unauthenticated(msg))
            }
            Err(e) => return Err(ProvisionError::SessionUnavailable(e.to_string())),
        };

        if require_privilege && !access.can_create_namespaces {
            return Err(ProvisionError::InsufficientPrivilege);
        }

        let message = if require_privilege {
            "session authenticated with namespace-create privilege"
        } else {
            "session authenticated"
        };
        let mut outcome = StepOutcome::succeeded(Step::Preconditions, message);

        let (monitoring_ns, service) = (
            &self.config.monitoring_namespace,
            &self.config.prometheus_service,
        );
        match self.cluster.service_exists(monitoring_ns, service).await {
            Ok(true) => {}
            Ok(false) => {
                outcome = outcome.with_warning(format!(
                    "Prometheus service {}/{} not found; is the monitoring stack deployed?",
                    monitoring_ns, service
                ))
            }
            Err(e) => {
                outcome = outcome.with_warning(format!(
                    "could not check for Prometheus service {}/{}: {}",
                    monitoring_ns, service, e
                ))
            }
        }

        Ok(outcome)
    }

    async fn ensure_namespace(&self) -> StepOutcome {
        let name = &self.config.namespace;
        match self.cluster.ensure_namespace(name).await {
            Ok(ensured) => StepOutcome::succeeded(
                Step::Namespace,
                format!("namespace {} {}", name, ensured.describe()),
            ),
            Err(e) => StepOutcome::warned(
                Step::Namespace,
                format!("could not create namespace {}: {}", name, e),
            ),
        }
    }

    async fn ensure_service_account(&self) -> StepOutcome {
        let (namespace, name) = (&self.config.namespace, &self.config.service_account);
        match self.cluster.ensure_service_account(namespace, name).await {
            Ok(ensured) => StepOutcome::succeeded(
                Step::ServiceAccount,
                format!("service account {}/{} {}", namespace, name, ensured.describe()),
            ),
            Err(e) => StepOutcome::warned(
                Step::ServiceAccount,
                format!(
                    "could not create service account {}/{}: {}",
                    namespace, name, e
                ),
            ),
        }
    }

    async fn grant_role(&self) -> StepOutcome {
        let grant = self.config.role_grant();
        match self.cluster.bind_cluster_role(&grant).await {
            Ok(ensured) => StepOutcome::succeeded(
                Step::RoleBinding,
                format!(
                    "cluster role {} bound to {} ({} {})",
                    grant.cluster_role,
                    grant.identity(),
                    grant.binding_name,
                    ensured.describe()
                ),
            ),
            Err(e) => StepOutcome::warned(
                Step::RoleBinding,
                format!(
                    "could not bind cluster role {} to {}: {}",
                    grant.cluster_role,
                    grant.identity(),
                    e
                ),
            ),
        }
    }

    async fn mint_token(&self, report: &mut ReportBuilder) -> Result<String, ProvisionError> {
        let (namespace, account) = (&self.config.namespace, &self.config.service_account);
        let validity = self.config.token_duration();

        let token = self
            .cluster
            .mint_token(namespace, account, validity)
            .await
            .map_err(|source| ProvisionError::TokenRequest {
                service_account: account.clone(),
                source,
            })?;

        if token.trim().is_empty() {
            return Err(ProvisionError::EmptyToken(account.clone()));
        }
        self.logger.log_token_minted(token.len(), validity.as_secs());

        let path = self.config.token_path();
        artifacts::write_token(&path, &token).map_err(|source| ProvisionError::Artifact {
            path: path.display().to_string(),
            source,
        })?;
        report.artifacts_mut().token_file = Some(path.display().to_string());

        self.record(
            report,
            StepOutcome::succeeded(
                Step::Token,
                format!(
                    "token valid for {}h written to {}",
                    validity.as_secs() / 3600,
                    path.display()
                ),
            ),
        );
        Ok(token)
    }

    async fn resolve_endpoints(
        &self,
        report: &mut ReportBuilder,
        persist: bool,
    ) -> EndpointDescriptor {
        let (namespace, route) = (
            &self.config.monitoring_namespace,
            &self.config.prometheus_route,
        );
        let mut warnings = Vec::new();

        let host = match self.cluster.resolve_route(namespace, route).await {
            Ok(host) => host,
            Err(e) => {
                warnings.push(format!("route lookup for {}/{} failed: {}", namespace, route, e));
                None
            }
        };

        let mut descriptor = EndpointDescriptor::new(host.as_deref(), self.config.internal_url());
        if let Some(external) = &descriptor.external {
            if let Err(e) = url::Url::parse(external) {
                warnings.push(format!("ignoring malformed route URL {}: {}", external, e));
                descriptor.external = None;
            }
        }

        let mut message = match &descriptor.external {
            Some(external) => format!("external {}; internal {}", external, descriptor.internal),
            None => format!("no external route; internal {}", descriptor.internal),
        };

        if persist {
            let path = self.config.endpoints_path();
            match artifacts::write_endpoints(&path, &descriptor) {
                Ok(()) => {
                    message.push_str(&format!(" (written to {})", path.display()));
                    report.artifacts_mut().endpoints_file = Some(path.display().to_string());
                }
                Err(e) => warnings.push(format!("could not write {}: {}", path.display(), e)),
            }
        }

        let outcome = warnings
            .into_iter()
            .fold(StepOutcome::succeeded(Step::Endpoints, message), |o, w| {
                o.with_warning(w)
            });
        self.record(report, outcome);
        report.set_endpoints(descriptor.clone());
        descriptor
    }

    async fn annotate_service(&self) -> StepOutcome {
        if !self.config.annotate_service {
            return StepOutcome::skipped(Step::ServiceAnnotation, "service annotation disabled");
        }

        let (namespace, service) = (
            &self.config.monitoring_namespace,
            &self.config.prometheus_service,
        );
        let annotations = self.config.scrape_annotations();
        match self
            .cluster
            .annotate_service(namespace, service, &annotations)
            .await
        {
            Ok(()) => StepOutcome::succeeded(
                Step::ServiceAnnotation,
                format!(
                    "service {}/{} annotated for scraping on port {}",
                    namespace, service, self.config.prometheus_port
                ),
            ),
            Err(e) => StepOutcome::warned(
                Step::ServiceAnnotation,
                format!("could not annotate service {}/{}: {}", namespace, service, e),
            ),
        }
    }

    async fn run_probes(&self, report: &mut ReportBuilder, token: &str) {
        if self.skip_probes {
            self.record(
                report,
                StepOutcome::skipped(Step::ConnectivityProbe, "probes disabled"),
            );
            self.record(
                report,
                StepOutcome::skipped(Step::MetricVerification, "probes disabled"),
            );
            return;
        }

        let connectivity = self.connectivity_probe(token).await;
        self.record(report, connectivity);

        let verification = self.verify_metric(token).await;
        self.record(report, verification);
    }

    async fn connectivity_probe(&self, token: &str) -> StepOutcome {
        let probe_config = &self.config.probe;
        let spec = probe::connectivity_probe_spec(&self.config, token);
        let policy = WaitPolicy::new(probe_config.ready_timeout(), probe_config.poll_interval());
        let url = self.config.internal_url();

        let run = match probe::run_ephemeral_workload(
            self.cluster.as_ref(),
            self.clock.as_ref(),
            &spec,
            policy,
        )
        .await
        {
            Ok(run) => run,
            Err(e) => {
                return StepOutcome::warned(
                    Step::ConnectivityProbe,
                    format!("could not launch probe pod {}: {}", spec.name, e),
                )
            }
        };

        let status = probe::parse_status_code(&run.output);
        if status == "200" {
            StepOutcome::succeeded(Step::ConnectivityProbe, format!("HTTP 200 from {}", url))
        } else if !run.finished {
            StepOutcome::warned(
                Step::ConnectivityProbe,
                format!(
                    "probe pod did not finish within {}s (phase {})",
                    probe_config.ready_timeout_secs, run.phase
                ),
            )
        } else if status == NO_RESPONSE_STATUS {
            StepOutcome::warned(
                Step::ConnectivityProbe,
                format!("no HTTP response from {} (status 000)", url),
            )
        } else {
            StepOutcome::warned(
                Step::ConnectivityProbe,
                format!("HTTP {} from {}", status, url),
            )
        }
    }

    async fn verify_metric(&self, token: &str) -> StepOutcome {
        let probe_config = &self.config.probe;
        let metric = &probe_config.metric;
        let spec = probe::metric_verification_spec(&self.config, token);
        let policy = WaitPolicy::new(probe_config.settle_time(), probe_config.poll_interval());

        let run = match probe::run_ephemeral_workload(
            self.cluster.as_ref(),
            self.clock.as_ref(),
            &spec,
            policy,
        )
        .await
        {
            Ok(run) => run,
            Err(e) => {
                return StepOutcome::warned(
                    Step::MetricVerification,
                    format!("could not launch verification job {}: {}", spec.name, e),
                )
            }
        };

        match probe::parse_marker(&run.output) {
            Some(true) => StepOutcome::succeeded(
                Step::MetricVerification,
                format!("metric {} present", metric),
            ),
            Some(false) => StepOutcome::warned(
                Step::MetricVerification,
                format!("metric {} not found in query result", metric),
            ),
            None => StepOutcome::warned(
                Step::MetricVerification,
                format!(
                    "no result from verification job after {}s (phase {})",
                    probe_config.settle_secs, run.phase
                ),
            ),
        }
    }

    fn generate_artifacts(
        &self,
        report: &mut ReportBuilder,
        endpoints: &EndpointDescriptor,
        token: &str,
    ) -> StepOutcome {
        let mut written = Vec::new();
        let mut warnings = Vec::new();

        let path = self.config.agent_config_path();
        match artifacts::write_agent_config(&path, &self.config, endpoints, token) {
            Ok(()) => {
                report.artifacts_mut().agent_config_file = Some(path.display().to_string());
                written.push(path.display().to_string());
            }
            Err(e) => warnings.push(format!("could not write {}: {}", path.display(), e)),
        }

        let path = self.config.queries_path();
        match artifacts::write_example_queries(&path, &self.config, endpoints) {
            Ok(()) => {
                report.artifacts_mut().queries_file = Some(path.display().to_string());
                written.push(path.display().to_string());
            }
            Err(e) => warnings.push(format!("could not write {}: {}", path.display(), e)),
        }

        let message = if written.is_empty() {
            "no configuration files written".to_string()
        } else {
            format!("wrote {}", written.join(", "))
        };

        warnings
            .into_iter()
            .fold(StepOutcome::succeeded(Step::Artifacts, message), |o, w| {
                o.with_warning(w)
            })
    }
}
