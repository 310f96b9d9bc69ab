//! File configuration for the dashtail binary

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dashtail_stream::{BackendConfig, DEFAULT_BACKEND_URL};
use dashtail_tail::TailConfig;

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: BackendSection,
    pub tail: TailSection,
}

/// `[backend]` section
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSection {
    pub url: String,

    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,

    /// Seconds without a frame before a stream counts as dropped; 0 disables
    pub idle_timeout_secs: u64,

    pub query_timeout_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            headers: BTreeMap::new(),
            idle_timeout_secs: 30,
            query_timeout_secs: 30,
        }
    }
}

/// `[tail]` section
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TailSection {
    pub limit: usize,
    pub max_records: usize,
    pub lookback_secs: u64,
    pub validation_limit: usize,
}

impl Default for TailSection {
    fn default() -> Self {
        let defaults = TailConfig::default();
        Self {
            limit: defaults.limit,
            max_records: defaults.max_records,
            lookback_secs: defaults.lookback.as_secs(),
            validation_limit: defaults.validation_limit,
        }
    }
}

impl Config {
    /// Load from `path`, else the user config file, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()));
        }

        if let Some(user_config) = default_path()
            && user_config.exists()
        {
            return Self::load_from_file(&user_config)
                .with_context(|| format!("Failed to load config from {}", user_config.display()));
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn backend_config(&self) -> BackendConfig {
        let idle_timeout = match self.backend.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        BackendConfig {
            url: self.backend.url.clone(),
            headers: self
                .backend
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            idle_timeout,
            query_timeout: Duration::from_secs(self.backend.query_timeout_secs),
        }
    }

    pub fn tail_config(&self) -> TailConfig {
        TailConfig {
            limit: self.tail.limit,
            max_records: self.tail.max_records,
            lookback: Duration::from_secs(self.tail.lookback_secs),
            validation_limit: self.tail.validation_limit,
            ..TailConfig::default()
        }
    }
}

/// `$XDG_CONFIG_HOME/dashtail/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dashtail").join("config.toml"))
}

/// Parse a `KEY=VALUE` header argument
pub fn parse_header(arg: &str) -> Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty header name in '{}'", arg));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
