//! Logging for provisioning runs
//!
//! Provides:
//! - Tracing subscriber setup (text or JSON, filtered by `RUST_LOG`)
//! - Structured run events with consistent fields

use crate::report::{RunReport, Step, StepOutcome, StepStatus};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_level` when set. Calling this twice is a
/// no-op for the second call.
pub fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Structured logger for workflow events
///
/// Every event carries the target namespace and service account so runs
/// against different clusters can be told apart in aggregated logs.
#[derive(Debug, Clone)]
pub struct RunLogger {
    namespace: String,
    service_account: String,
}

impl RunLogger {
    pub fn new(namespace: impl Into<String>, service_account: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service_account: service_account.into(),
        }
    }

    pub fn log_run_started(&self, mode: &str) {
        info!(
            event = "run_started",
            namespace = %self.namespace,
            service_account = %self.service_account,
            mode = %mode,
            "Provisioning run started"
        );
    }

    pub fn log_step(&self, outcome: &StepOutcome) {
        match outcome.status {
            StepStatus::Succeeded => info!(
                event = "step_completed",
                namespace = %self.namespace,
                step = ?outcome.step,
                message = %outcome.message,
                "{}", outcome.step
            ),
            StepStatus::Skipped => info!(
                event = "step_skipped",
                namespace = %self.namespace,
                step = ?outcome.step,
                message = %outcome.message,
                "{}", outcome.step
            ),
            StepStatus::Warned => warn!(
                event = "step_warned",
                namespace = %self.namespace,
                step = ?outcome.step,
                message = %outcome.message,
                warnings = ?outcome.warnings,
                "{}", outcome.step
            ),
        }
    }

    /// Token minted; only its length is logged
    pub fn log_token_minted(&self, token_len: usize, validity_secs: u64) {
        info!(
            event = "token_minted",
            namespace = %self.namespace,
            service_account = %self.service_account,
            token_len = token_len,
            validity_secs = validity_secs,
            "Service account token minted"
        );
    }

    pub fn log_run_aborted(&self, step: Step, reason: &str) {
        error!(
            event = "run_aborted",
            namespace = %self.namespace,
            service_account = %self.service_account,
            step = ?step,
            reason = %reason,
            "Provisioning run aborted"
        );
    }

    pub fn log_run_finished(&self, report: &RunReport) {
        let elapsed_ms = (report.finished_at - report.started_at).num_milliseconds();
        if report.has_warnings() {
            warn!(
                event = "run_finished",
                namespace = %self.namespace,
                status = ?report.status,
                warnings = report.warning_count(),
                elapsed_ms = elapsed_ms,
                "Provisioning run completed with warnings"
            );
        } else {
            info!(
                event = "run_finished",
                namespace = %self.namespace,
                status = ?report.status,
                elapsed_ms = elapsed_ms,
                "Provisioning run completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_logger_creation() {
        let logger = RunLogger::new("dynatrace-monitoring", "dynatrace-prometheus");
        assert_eq!(logger.namespace, "dynatrace-monitoring");
        assert_eq!(logger.service_account, "dynatrace-prometheus");
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing("debug", LogFormat::Text);
        init_tracing("info", LogFormat::Json);
        RunLogger::new("ns", "sa").log_step(&StepOutcome::warned(Step::ConnectivityProbe, "HTTP 000"));
    }
}
