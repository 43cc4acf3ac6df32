//! HTTP client for the Prometheus query API behind the external route

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

/// Prometheus query client authenticating with a bearer token
pub struct PrometheusClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl PrometheusClient {
    /// Create a new client; `insecure` skips TLS certificate verification
    pub fn new(base_url: &str, token: &str, insecure: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid Prometheus URL")?;

        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
        })
    }

    /// Run an instant query
    pub async fn query(&self, expr: &str) -> Result<QueryResponse> {
        let url = self.base_url.join("api/v1/query").context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("query", expr)])
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Prometheus error ({}): {}", status, body.trim());
        }

        let body: QueryResponse = response.json().await.context("Failed to parse response")?;
        if body.status != "success" {
            anyhow::bail!(
                "Prometheus query failed: {}",
                body.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    #[serde(default)]
    pub data: QueryData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<serde_json::Value>,
}
