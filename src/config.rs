//! Configuration loader and validator for the portal sync service.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub portal: Portal,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub drain_interval_ms: u64,
    pub request_timeout_secs: u64,
}

/// Portal connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Portal {
    pub base_url: String,
    pub identity_email: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Parsed portal base URL, normalized with a trailing slash so that
    /// relative endpoint paths join under it instead of replacing the last
    /// path segment.
    pub fn portal_base_url(&self) -> Result<Url, ConfigError> {
        let raw = if self.portal.base_url.ends_with('/') {
            self.portal.base_url.clone()
        } else {
            format!("{}/", self.portal.base_url)
        };
        Url::parse(&raw).map_err(|_| ConfigError::Invalid("portal.base_url must be a valid URL"))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.drain_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.drain_interval_ms must be > 0"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }

    if Url::parse(cfg.portal.base_url.trim()).is_err() {
        return Err(ConfigError::Invalid("portal.base_url must be a valid URL"));
    }

    if !EMAIL_RE.is_match(cfg.portal.identity_email.trim()) {
        return Err(ConfigError::Invalid(
            "portal.identity_email must be an email address",
        ));
    }

    Ok(())
}

/// Example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  drain_interval_ms: 30000
  request_timeout_secs: 15

portal:
  base_url: "https://portal.example.com/api/v1"
  identity_email: "sync@condominio.example.com"
"#
}
