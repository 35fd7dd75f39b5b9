//! Acceptance run configuration.
//!
//! Values come from an optional TOML file, overridden by `VCD_*`
//! environment variables (e.g. `VCD_ORG`, `VCD_CATALOG_ITEM`,
//! `VCD_SHORT_TEST=1`).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use vcd_provider::RestConfig;
use vcd_reconcile::PollPolicy;

use crate::document::Defaults;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "VCD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
}

/// Settings for an acceptance run.
#[derive(Clone, Deserialize)]
pub struct AcceptanceConfig {
    /// Platform API endpoint. Not needed for simulated runs.
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for the API.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub vdc: String,

    #[serde(default)]
    pub catalog: String,

    #[serde(default)]
    pub catalog_item: String,

    #[serde(default)]
    pub edge_gateway: String,

    /// Delay between status reads, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up on a transitional status after this many seconds.
    #[serde(default)]
    pub settle_timeout_secs: Option<u64>,

    /// Skip acceptance scenarios entirely.
    #[serde(default)]
    pub short_test: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl fmt::Debug for AcceptanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptanceConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("org", &self.org)
            .field("vdc", &self.vdc)
            .field("catalog", &self.catalog)
            .field("catalog_item", &self.catalog_item)
            .field("edge_gateway", &self.edge_gateway)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("settle_timeout_secs", &self.settle_timeout_secs)
            .field("short_test", &self.short_test)
            .finish()
    }
}

impl AcceptanceConfig {
    /// Load from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment instead of the process one.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true)
                .source(env),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        Ok(loaded)
    }

    /// Fail early, naming every required setting that is missing.
    ///
    /// `live` also requires an endpoint.
    pub fn precheck(&self, live: bool) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        let required = [
            ("VCD_ORG", &self.org),
            ("VCD_VDC", &self.vdc),
            ("VCD_CATALOG", &self.catalog),
            ("VCD_CATALOG_ITEM", &self.catalog_item),
            ("VCD_EDGE_GATEWAY", &self.edge_gateway),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        if live && self.url.as_deref().is_none_or(|url| url.trim().is_empty()) {
            missing.push("VCD_URL");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing))
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let policy = PollPolicy::new(Duration::from_millis(self.poll_interval_ms));
        match self.settle_timeout_secs {
            Some(secs) => policy.with_timeout(Duration::from_secs(secs)),
            None => policy,
        }
    }

    /// Client settings for a live endpoint.
    pub fn rest_config(&self) -> Result<RestConfig, ConfigError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| ConfigError::Missing(vec!["VCD_URL"]))?;
        let mut rest = RestConfig::new(url);
        rest.token = self.token.clone();
        rest.task_poll = self.poll_policy();
        Ok(rest)
    }

    /// Fallback values for documents that leave scope or template unset.
    pub fn defaults(&self) -> Defaults {
        Defaults {
            org: self.org.clone(),
            vdc: self.vdc.clone(),
            catalog: self.catalog.clone(),
            catalog_item: self.catalog_item.clone(),
            edge_gateway: self.edge_gateway.clone(),
        }
    }
}
