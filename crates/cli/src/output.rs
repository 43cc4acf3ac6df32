//! Output formatting utilities

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use provision_lib::{EndpointDescriptor, ProvisionError, RunReport, StepOutcome, StepStatus};
use serde::Serialize;
use std::process::ExitCode;
use tabled::{settings::Style, Table, Tabled};

/// Exit status when `--strict` is set and the run raised warnings
pub const STRICT_WARNING_EXIT: u8 = 2;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled>(items: &[T]) {
    if items.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Live progress line for a finished step
pub fn print_step(outcome: &StepOutcome) {
    let line = format!("{}: {}", outcome.step.title().bold(), outcome.message);
    match outcome.status {
        StepStatus::Succeeded => print_success(&line),
        StepStatus::Warned => print_warning(&line),
        StepStatus::Skipped => print_info(&line),
    }
    for warning in &outcome.warnings {
        println!("    {}", warning.yellow());
    }
}

/// Color status based on value
pub fn color_status(status: StepStatus) -> String {
    let text = status.to_string();
    match status {
        StepStatus::Succeeded => text.green().to_string(),
        StepStatus::Warned => text.yellow().to_string(),
        StepStatus::Skipped => text.dimmed().to_string(),
    }
}

/// Row for the step summary table
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Details")]
    details: String,
}

impl From<&StepOutcome> for StepRow {
    fn from(outcome: &StepOutcome) -> Self {
        let mut details = outcome.message.clone();
        for warning in &outcome.warnings {
            details.push('\n');
            details.push_str(warning);
        }
        Self {
            step: outcome.step.title().to_string(),
            status: color_status(outcome.status),
            details,
        }
    }
}

/// Row for the endpoint table
#[derive(Tabled)]
pub struct EndpointRow {
    #[tabled(rename = "Endpoint")]
    pub kind: String,
    #[tabled(rename = "URL")]
    pub url: String,
}

pub fn endpoint_rows(endpoints: &EndpointDescriptor) -> Vec<EndpointRow> {
    let mut rows = Vec::new();
    if let Some(external) = &endpoints.external {
        rows.push(EndpointRow {
            kind: "External".to_string(),
            url: external.clone(),
        });
    }
    rows.push(EndpointRow {
        kind: "Internal".to_string(),
        url: endpoints.internal.clone(),
    });
    rows
}

/// Print the final summary of a run
pub fn print_report(report: &RunReport) {
    println!();
    println!("{}", "Summary".bold());
    println!("{}", "=".repeat(50));
    let rows: Vec<StepRow> = report.steps.iter().map(StepRow::from).collect();
    print_table(&rows);

    if let Some(endpoints) = &report.endpoints {
        println!();
        print_table(&endpoint_rows(endpoints));
    }

    let artifacts = &report.artifacts;
    let files: Vec<&String> = [
        &artifacts.token_file,
        &artifacts.endpoints_file,
        &artifacts.agent_config_file,
        &artifacts.queries_file,
    ]
    .into_iter()
    .flatten()
    .collect();
    if !files.is_empty() {
        println!();
        println!("{}", "Files".bold());
        for file in files {
            println!("  {}", file.cyan());
        }
    }

    println!();
    let finished = report.finished_at.with_timezone(&chrono::Local);
    if report.has_warnings() {
        print_warning(&format!(
            "Completed with {} warning(s) at {}",
            report.warning_count(),
            finished.format("%H:%M:%S")
        ));
    } else {
        print_success(&format!("Completed at {}", finished.format("%H:%M:%S")));
    }
}

/// Process exit status for a finished run
pub fn exit_code(has_warnings: bool, strict: bool) -> ExitCode {
    if strict && has_warnings {
        ExitCode::from(STRICT_WARNING_EXIT)
    } else {
        ExitCode::SUCCESS
    }
}

/// What to fix before retrying, for errors raised before the cluster was touched
pub fn error_hint(err: &ProvisionError) -> Option<&'static str> {
    if !err.is_precondition() {
        return None;
    }
    match err {
        ProvisionError::Config(_) => {
            Some("Check the configuration file and DTP_* environment variables")
        }
        _ => Some("Log in with `oc login` as a user allowed to create namespaces and cluster role bindings"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_lib::Step;

    #[test]
    fn test_endpoint_rows_order() {
        let endpoints = EndpointDescriptor::new(Some("prom.apps.example.com"), "https://internal:9091");
        let rows = endpoint_rows(&endpoints);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "External");
        assert_eq!(rows[0].url, "https://prom.apps.example.com");
        assert_eq!(rows[1].kind, "Internal");

        let internal_only = endpoint_rows(&EndpointDescriptor::new(None, "https://internal:9091"));
        assert_eq!(internal_only.len(), 1);
    }

    #[test]
    fn test_step_row_includes_warnings() {
        let outcome = StepOutcome::succeeded(Step::Preconditions, "session authenticated")
            .with_warning("Prometheus service not found");
        let row = StepRow::from(&outcome);
        assert_eq!(row.step, "Precondition check");
        assert!(row.details.contains("Prometheus service not found"));
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(false, true), ExitCode::SUCCESS);
        assert_eq!(exit_code(true, false), ExitCode::SUCCESS);
        assert_eq!(exit_code(true, true), ExitCode::from(STRICT_WARNING_EXIT));
    }

    #[test]
    fn test_error_hint_only_before_cluster_changes() {
        let hint = error_hint(&ProvisionError::InsufficientPrivilege).unwrap();
        assert!(hint.contains("oc login"));
        assert!(error_hint(&ProvisionError::Config("bad".into()))
            .unwrap()
            .contains("configuration"));
        assert!(error_hint(&ProvisionError::EmptyToken("dynatrace-monitoring".into())).is_none());
    }
}
