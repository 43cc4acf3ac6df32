//! `dtp setup`

use anyhow::Result;
use provision_lib::{ClusterClient, ProvisionConfig, Provisioner};
use std::process::ExitCode;
use std::sync::Arc;

use crate::output::{self, OutputFormat};

/// Run the full provisioning workflow
pub async fn run(
    cluster: Arc<dyn ClusterClient>,
    config: ProvisionConfig,
    skip_probes: bool,
    strict: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    if format == OutputFormat::Table {
        output::print_info(&format!(
            "Provisioning service account {}/{} for Dynatrace",
            config.namespace, config.service_account
        ));
    }

    let mut provisioner = Provisioner::new(cluster, config).skip_probes(skip_probes);
    if format == OutputFormat::Table {
        provisioner = provisioner.with_observer(output::print_step);
    }

    let report = provisioner.run().await?;

    match format {
        OutputFormat::Json => output::print_json(&report)?,
        OutputFormat::Table => output::print_report(&report),
    }

    Ok(output::exit_code(report.has_warnings(), strict))
}
