//! Configuration management for the CLI

use anyhow::{Context, Result};
use provision_lib::ProvisionConfig;
use std::path::{Path, PathBuf};

use crate::TargetArgs;

/// Values given on the command line; they win over file and environment
#[derive(Debug, Default)]
pub struct Overrides {
    pub namespace: Option<String>,
    pub service_account: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub token_duration_hours: Option<u64>,
    pub annotate_service: Option<bool>,
}

impl Overrides {
    pub fn from_target(target: TargetArgs) -> Self {
        Self {
            namespace: target.namespace,
            service_account: target.service_account,
            output_dir: target.output_dir,
            ..Self::default()
        }
    }

    pub fn token_duration_hours(mut self, hours: Option<u64>) -> Self {
        self.token_duration_hours = hours;
        self
    }

    /// Only `false` overrides; the flag can disable annotation but not force it on
    pub fn annotate_service(mut self, enabled: bool) -> Self {
        self.annotate_service = if enabled { None } else { Some(false) };
        self
    }

    pub fn apply(self, mut config: ProvisionConfig) -> ProvisionConfig {
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(service_account) = self.service_account {
            config.service_account = service_account;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(hours) = self.token_duration_hours {
            config.token_duration_secs = hours.saturating_mul(3600);
        }
        if let Some(annotate) = self.annotate_service {
            config.annotate_service = annotate;
        }
        config
    }
}

/// Load file and environment configuration, then apply command line overrides
pub fn load(explicit: Option<&Path>, overrides: Overrides) -> Result<ProvisionConfig> {
    let path = resolve_config_path(explicit);
    tracing::debug!(path = ?path, "Loading configuration");
    let config = ProvisionConfig::load(path.as_deref()).with_context(|| match &path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    let config = overrides.apply(config);
    config.validate()?;
    Ok(config)
}

/// The explicit path, or the default file when it exists
fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    default_config_path().filter(|path| path.exists())
}

/// Get the configuration file path
fn default_config_path() -> Option<PathBuf> {
    let home = dirs_next::home_dir()?;
    Some(home.join(".config").join("dtp").join("config.toml"))
}
