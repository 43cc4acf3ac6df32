//! `dtp verify`

use anyhow::{Context, Result};
use provision_lib::artifacts;
use provision_lib::{ClusterClient, ProvisionConfig, Provisioner, RunReport};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crate::client::PrometheusClient;
use crate::output::{self, OutputFormat};

pub struct VerifyOptions {
    pub token_file: Option<PathBuf>,
    pub external: bool,
    pub insecure: bool,
    pub strict: bool,
}

/// Result of querying the external route from this machine
#[derive(Debug, Serialize)]
struct ExternalCheck {
    url: Option<String>,
    ok: bool,
    message: String,
}

#[derive(Serialize)]
struct VerifyOutput<'a> {
    report: &'a RunReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    external: Option<&'a ExternalCheck>,
}

/// Re-run the in-cluster probes with the token written by `setup`
pub async fn run(
    cluster: Arc<dyn ClusterClient>,
    config: ProvisionConfig,
    options: VerifyOptions,
    format: OutputFormat,
) -> Result<ExitCode> {
    let token_path = options.token_file.unwrap_or_else(|| config.token_path());
    let token = artifacts::read_token(&token_path)
        .with_context(|| format!("Failed to read token from {}", token_path.display()))?;

    let query = config.probe.query.clone();
    let mut provisioner = Provisioner::new(cluster, config);
    if format == OutputFormat::Table {
        output::print_info(&format!("Verifying with token from {}", token_path.display()));
        provisioner = provisioner.with_observer(output::print_step);
    }

    let report = provisioner.verify(&token).await?;

    let external = if options.external {
        let external_url = report.endpoints.as_ref().and_then(|e| e.external.clone());
        Some(check_external(external_url, &token, &query, options.insecure).await)
    } else {
        None
    };

    match format {
        OutputFormat::Json => output::print_json(&VerifyOutput {
            report: &report,
            external: external.as_ref(),
        })?,
        OutputFormat::Table => {
            if let Some(check) = &external {
                if check.ok {
                    output::print_success(&check.message);
                } else {
                    output::print_warning(&check.message);
                }
            }
            output::print_report(&report);
        }
    }

    let external_failed = external.as_ref().is_some_and(|check| !check.ok);
    Ok(output::exit_code(
        report.has_warnings() || external_failed,
        options.strict,
    ))
}

async fn check_external(
    url: Option<String>,
    token: &str,
    query: &str,
    insecure: bool,
) -> ExternalCheck {
    let Some(url) = url else {
        return ExternalCheck {
            url: None,
            ok: false,
            message: "No external route; external query skipped".to_string(),
        };
    };

    let result = match PrometheusClient::new(&url, token, insecure) {
        Ok(client) => client.query(query).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(response) => ExternalCheck {
            message: format!(
                "External query '{}' answered with {} series from {}",
                query,
                response.data.result.len(),
                url
            ),
            url: Some(url),
            ok: true,
        },
        Err(e) => ExternalCheck {
            message: format!("External query against {} failed: {:#}", url, e),
            url: Some(url),
            ok: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_external_check_without_route() {
        let check = check_external(None, "t", "up", false).await;
        assert!(!check.ok);
        assert!(check.url.is_none());
    }

    #[tokio::test]
    async fn test_external_check_against_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/query")
            .match_query(mockito::Matcher::Any)
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#)
            .create_async()
            .await;

        let check = check_external(Some(server.url()), "tok", "up", false).await;
        assert!(check.ok, "{}", check.message);
        assert!(check.message.contains("0 series"));
    }
}
