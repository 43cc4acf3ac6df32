//! Run report
//!
//! Tracks the outcome of every workflow step and derives the overall status
//! of a run from them.

use crate::models::{ArtifactPaths, EndpointDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preconditions,
    Namespace,
    ServiceAccount,
    RoleBinding,
    Token,
    Endpoints,
    ServiceAnnotation,
    ConnectivityProbe,
    MetricVerification,
    Artifacts,
}

impl Step {
    pub const ALL: [Step; 10] = [
        Step::Preconditions,
        Step::Namespace,
        Step::ServiceAccount,
        Step::RoleBinding,
        Step::Token,
        Step::Endpoints,
        Step::ServiceAnnotation,
        Step::ConnectivityProbe,
        Step::MetricVerification,
        Step::Artifacts,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Step::Preconditions => "Precondition check",
            Step::Namespace => "Ensure namespace",
            Step::ServiceAccount => "Ensure service account",
            Step::RoleBinding => "Grant monitoring role",
            Step::Token => "Mint token",
            Step::Endpoints => "Resolve endpoints",
            Step::ServiceAnnotation => "Annotate Prometheus service",
            Step::ConnectivityProbe => "Connectivity probe",
            Step::MetricVerification => "Metric verification",
            Step::Artifacts => "Generate configuration",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Outcome class of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step reached its goal
    Succeeded,
    /// Step degraded; the run continued
    Warned,
    /// Step was not run
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => f.write_str("succeeded"),
            StepStatus::Warned => f.write_str("warned"),
            StepStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// What happened in one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: Step,
    pub status: StepStatus,
    pub message: String,
    /// Additional warnings raised while the step still succeeded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn succeeded(step: Step, message: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Succeeded, message)
    }

    pub fn warned(step: Step, message: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Warned, message)
    }

    pub fn skipped(step: Step, message: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Skipped, message)
    }

    fn new(step: Step, status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            step,
            status,
            message: message.into(),
            warnings: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Attach a warning; a succeeded step becomes warned
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        if self.status == StepStatus::Succeeded {
            self.status = StepStatus::Warned;
        }
        self
    }
}

/// Overall status of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithWarnings,
}

/// Report of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EndpointDescriptor>,
    pub artifacts: ArtifactPaths,
}

impl RunReport {
    /// Compute overall status from step outcomes
    pub fn compute_status(steps: &[StepOutcome]) -> RunStatus {
        if steps.iter().any(|s| s.status == StepStatus::Warned) {
            RunStatus::CompletedWithWarnings
        } else {
            RunStatus::Completed
        }
    }

    pub fn has_warnings(&self) -> bool {
        self.status == RunStatus::CompletedWithWarnings
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn warning_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Warned)
            .count()
    }
}

/// Accumulates step outcomes during a run
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    started_at: DateTime<Utc>,
    steps: Vec<StepOutcome>,
    endpoints: Option<EndpointDescriptor>,
    artifacts: ArtifactPaths,
}

impl ReportBuilder {
    pub(crate) fn new() -> Self {
        Self {
            started_at: Utc::now(),
            steps: Vec::new(),
            endpoints: None,
            artifacts: ArtifactPaths::default(),
        }
    }

    pub(crate) fn push(&mut self, outcome: StepOutcome) {
        self.steps.push(outcome);
    }

    pub(crate) fn set_endpoints(&mut self, endpoints: EndpointDescriptor) {
        self.endpoints = Some(endpoints);
    }

    pub(crate) fn artifacts_mut(&mut self) -> &mut ArtifactPaths {
        &mut self.artifacts
    }

    pub(crate) fn finish(self) -> RunReport {
        RunReport {
            status: RunReport::compute_status(&self.steps),
            started_at: self.started_at,
            finished_at: Utc::now(),
            steps: self.steps,
            endpoints: self.endpoints,
            artifacts: self.artifacts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_all_succeeded() {
        let steps = vec![
            StepOutcome::succeeded(Step::Namespace, "created"),
            StepOutcome::skipped(Step::ConnectivityProbe, "disabled"),
        ];
        assert_eq!(RunReport::compute_status(&steps), RunStatus::Completed);
    }

    #[test]
    fn test_status_with_warning() {
        let steps = vec![
            StepOutcome::succeeded(Step::Namespace, "created"),
            StepOutcome::warned(Step::ConnectivityProbe, "HTTP 403"),
        ];
        assert_eq!(
            RunReport::compute_status(&steps),
            RunStatus::CompletedWithWarnings
        );
    }

    #[test]
    fn test_with_warning_degrades_success() {
        let outcome = StepOutcome::succeeded(Step::Preconditions, "session ok")
            .with_warning("metrics stack not found");
        assert_eq!(outcome.status, StepStatus::Warned);
        assert_eq!(outcome.warnings.len(), 1);

        let skipped = StepOutcome::skipped(Step::Artifacts, "x").with_warning("y");
        assert_eq!(skipped.status, StepStatus::Skipped);
    }

    #[test]
    fn test_report_json_shape() {
        let mut builder = ReportBuilder::new();
        builder.push(StepOutcome::succeeded(Step::Token, "minted"));
        let report = builder.finish();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["steps"][0]["step"], "token");
        assert_eq!(json["steps"][0]["status"], "succeeded");
        assert!(json["steps"][0].get("warnings").is_none());
    }

    #[test]
    fn test_step_order() {
        assert_eq!(Step::ALL.first(), Some(&Step::Preconditions));
        assert_eq!(Step::ALL.last(), Some(&Step::Artifacts));
    }
}
