//! Files produced by a run
//!
//! The token file holds exactly the minted token. The endpoint descriptor,
//! agent configuration and example queries are rendered from the token and
//! the resolved endpoints; their content is not validated.

use crate::config::ProvisionConfig;
use crate::models::EndpointDescriptor;
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Cluster-operator health metrics the monitoring platform should ingest
pub const OPERATOR_METRICS: &[&str] = &[
    "cluster_operator_up",
    "cluster_operator_conditions",
    "cluster_version",
    "kube_node_status_condition",
    "up",
];

/// Write a file readable only by the owner
pub fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn write_public(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)
}

/// Persist the raw token, byte for byte
pub fn write_token(path: &Path, token: &str) -> io::Result<()> {
    write_private(path, token)
}

/// Read a token written by [`write_token`]
pub fn read_token(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

pub fn write_endpoints(path: &Path, endpoints: &EndpointDescriptor) -> io::Result<()> {
    write_public(path, &endpoints.to_descriptor_text())
}

pub fn read_endpoints(path: &Path) -> io::Result<Option<EndpointDescriptor>> {
    Ok(EndpointDescriptor::parse(&fs::read_to_string(path)?))
}

#[derive(Debug, Serialize)]
struct AgentConfig<'a> {
    prometheus: PrometheusSource<'a>,
}

#[derive(Debug, Serialize)]
struct PrometheusSource<'a> {
    name: &'a str,
    endpoint: &'a str,
    internal_endpoint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_endpoint: Option<&'a str>,
    auth: BearerAuth<'a>,
    tls: Tls,
    scrape: Scrape<'a>,
    annotations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BearerAuth<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    service_account: String,
    token_file: String,
    token: &'a str,
}

#[derive(Debug, Serialize)]
struct Tls {
    skip_verify: bool,
}

#[derive(Debug, Serialize)]
struct Scrape<'a> {
    query_path: &'a str,
    interval: &'a str,
    metrics: &'a [&'a str],
}

/// Agent configuration document pointing the monitoring agent at Prometheus
pub fn render_agent_config(
    config: &ProvisionConfig,
    endpoints: &EndpointDescriptor,
    token: &str,
) -> Result<String, serde_yaml::Error> {
    let document = AgentConfig {
        prometheus: PrometheusSource {
            name: "openshift-prometheus",
            // An ActiveGate outside the cluster needs the route.
            endpoint: endpoints.external.as_deref().unwrap_or(&endpoints.internal),
            internal_endpoint: &endpoints.internal,
            external_endpoint: endpoints.external.as_deref(),
            auth: BearerAuth {
                kind: "bearer",
                service_account: config.role_grant().identity(),
                token_file: config.token_path().display().to_string(),
                token,
            },
            tls: Tls { skip_verify: true },
            scrape: Scrape {
                query_path: "/api/v1/query",
                interval: "60s",
                metrics: OPERATOR_METRICS,
            },
            annotations: config
                .scrape_annotations()
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        },
    };

    let yaml = serde_yaml::to_string(&document)?;
    Ok(format!(
        "# Dynatrace Prometheus integration\n# Generated {}\n{}",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        yaml
    ))
}

/// Example queries for the monitoring platform and for direct API access
pub fn render_example_queries(config: &ProvisionConfig, endpoints: &EndpointDescriptor) -> String {
    let base = endpoints.external.as_deref().unwrap_or(&endpoints.internal);
    let token_file = config.token_path().display().to_string();

    let mut doc = String::new();
    doc.push_str("# Example queries\n\n");
    doc.push_str(&format!(
        "Generated {} for service account `{}`.\n\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        config.role_grant().identity()
    ));

    doc.push_str("## DQL\n\n");
    doc.push_str("Cluster operators reporting up:\n\n```\n");
    doc.push_str("timeseries up = avg(cluster_operator_up), by: {name}\n");
    doc.push_str("```\n\nDegraded cluster operators:\n\n```\n");
    doc.push_str(
        "timeseries degraded = max(cluster_operator_conditions), by: {name}, filter: { condition == \"Degraded\" }\n",
    );
    doc.push_str("| filter arrayMax(degraded) > 0\n");
    doc.push_str("```\n\nUnavailable cluster operators:\n\n```\n");
    doc.push_str(
        "timeseries available = min(cluster_operator_conditions), by: {name}, filter: { condition == \"Available\" }\n",
    );
    doc.push_str("| filter arrayMin(available) < 1\n");
    doc.push_str("```\n\nNodes not ready:\n\n```\n");
    doc.push_str(
        "timeseries ready = min(kube_node_status_condition), by: {node}, filter: { condition == \"Ready\" and status == \"true\" }\n",
    );
    doc.push_str("| filter arrayMin(ready) < 1\n```\n\n");

    doc.push_str("## Prometheus HTTP API\n\n```sh\n");
    for query in ["cluster_operator_up", "cluster_operator_conditions{condition=\"Degraded\"} == 1"] {
        doc.push_str(&format!(
            "curl -sk -G -H \"Authorization: Bearer $(cat {})\" --data-urlencode 'query={}' {}/api/v1/query\n",
            token_file, query, base
        ));
    }
    doc.push_str("```\n");
    doc
}

pub fn write_agent_config(
    path: &Path,
    config: &ProvisionConfig,
    endpoints: &EndpointDescriptor,
    token: &str,
) -> io::Result<()> {
    let rendered = render_agent_config(config, endpoints, token)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    // embeds the token
    write_private(path, &rendered)
}

pub fn write_example_queries(
    path: &Path,
    config: &ProvisionConfig,
    endpoints: &EndpointDescriptor,
) -> io::Result<()> {
    write_public(path, &render_example_queries(config, endpoints))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(external: Option<&str>) -> EndpointDescriptor {
        EndpointDescriptor::new(external, ProvisionConfig::default().internal_url())
    }

    #[test]
    fn test_token_written_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        write_token(&path, "eyJhbGciOi.abc.def").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "eyJhbGciOi.abc.def");
        assert_eq!(read_token(&path).unwrap(), "eyJhbGciOi.abc.def");
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token.txt");
        write_token(&path, "t").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_token_overwrite_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        write_token(&path, "a-much-longer-old-token").unwrap();
        write_token(&path, "new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_endpoints_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoints.txt");
        let descriptor = endpoints(Some("prom.apps.example.com"));
        write_endpoints(&path, &descriptor).unwrap();
        assert_eq!(read_endpoints(&path).unwrap(), Some(descriptor));
    }

    #[test]
    fn test_agent_config_prefers_external() {
        let config = ProvisionConfig::default();
        let yaml = render_agent_config(&config, &endpoints(Some("prom.apps.example.com")), "tok")
            .unwrap();

        let body: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            body["prometheus"]["endpoint"].as_str(),
            Some("https://prom.apps.example.com")
        );
        assert_eq!(body["prometheus"]["auth"]["token"].as_str(), Some("tok"));
        assert_eq!(
            body["prometheus"]["auth"]["service_account"].as_str(),
            Some("system:serviceaccount:dynatrace-monitoring:dynatrace-prometheus")
        );
    }

    #[test]
    fn test_agent_config_falls_back_to_internal() {
        let yaml = render_agent_config(&ProvisionConfig::default(), &endpoints(None), "tok").unwrap();
        let body: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            body["prometheus"]["endpoint"].as_str(),
            Some("https://prometheus-k8s.openshift-monitoring.svc:9091")
        );
        assert!(body["prometheus"].get("external_endpoint").is_none());
    }

    #[test]
    fn test_example_queries_reference_endpoint_and_token_file() {
        let doc = render_example_queries(&ProvisionConfig::default(), &endpoints(None));
        assert!(doc.contains("timeseries up = avg(cluster_operator_up)"));
        assert!(doc.contains("https://prometheus-k8s.openshift-monitoring.svc:9091/api/v1/query"));
        assert!(doc.contains("dynatrace-prometheus-token.txt"));
    }
}
