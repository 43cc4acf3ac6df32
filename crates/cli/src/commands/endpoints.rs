//! `dtp endpoints`

use anyhow::{Context, Result};
use provision_lib::{ClusterClient, EndpointDescriptor, ProvisionConfig};

use crate::output::{self, OutputFormat};

/// Print the external and internal Prometheus endpoints
pub async fn show(
    cluster: &dyn ClusterClient,
    config: &ProvisionConfig,
    format: OutputFormat,
) -> Result<()> {
    let host = cluster
        .resolve_route(&config.monitoring_namespace, &config.prometheus_route)
        .await
        .with_context(|| {
            format!(
                "Failed to look up route {}/{}",
                config.monitoring_namespace, config.prometheus_route
            )
        })?;
    let endpoints = EndpointDescriptor::new(host.as_deref(), config.internal_url());

    match format {
        OutputFormat::Json => output::print_json(&endpoints)?,
        OutputFormat::Table => {
            output::print_table(&output::endpoint_rows(&endpoints));
            if endpoints.external.is_none() {
                output::print_info(&format!(
                    "No route {}/{}; only the in-cluster endpoint is available",
                    config.monitoring_namespace, config.prometheus_route
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_lib::InMemoryCluster;

    #[tokio::test]
    async fn test_show_reads_route() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig {
            output_dir: dir.path().to_path_buf(),
            ..ProvisionConfig::default()
        };
        let cluster = InMemoryCluster::new().with_route(
            "openshift-monitoring",
            "prometheus-k8s",
            "prometheus-k8s.apps.example.com",
        );

        show(&cluster, &config, OutputFormat::Json).await.unwrap();

        // read only
        assert!(!config.endpoints_path().exists());
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_show_leaves_recorded_descriptor_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionConfig {
            output_dir: dir.path().to_path_buf(),
            ..ProvisionConfig::default()
        };
        std::fs::write(config.endpoints_path(), "not a descriptor\n").unwrap();
        let cluster = InMemoryCluster::new();

        show(&cluster, &config, OutputFormat::Table).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(config.endpoints_path()).unwrap(),
            "not a descriptor\n"
        );
    }
}
