//! Configuration loader and validator for the price-watch service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

pub const DEFAULT_FAVORITES_TOPIC: &str = "FAVORITE_PRODUCTS";

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub bus: Bus,
    pub gateway: Gateway,
    #[serde(default)]
    pub scheduler: Scheduler,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides the default `sqlite://<data_dir>/pricewatch.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bus {
    pub favorites_topic: String,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            favorites_topic: DEFAULT_FAVORITES_TOPIC.to_string(),
        }
    }
}

/// Notification gateway endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gateway {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Gateway {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Favorites poller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub enabled: bool,
    pub interval_secs: u64,
    #[serde(default)]
    pub source_base_url: Option<String>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            source_base_url: None,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the config file.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            self.app
                .database_url
                .clone()
                .unwrap_or_else(|| format!("sqlite://{}/pricewatch.db?mode=rwc", self.app.data_dir))
        })
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

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.bus.favorites_topic.trim().is_empty() {
        return Err(ConfigError::Invalid("bus.favorites_topic must be non-empty"));
    }
    if cfg.gateway.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("gateway.base_url must be non-empty"));
    }
    if cfg.gateway.timeout_ms == 0 {
        return Err(ConfigError::Invalid("gateway.timeout_ms must be > 0"));
    }
    if cfg.scheduler.enabled {
        if cfg.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.interval_secs must be > 0"));
        }
        let missing_source = cfg
            .scheduler
            .source_base_url
            .as_deref()
            .map_or(true, |s| s.trim().is_empty());
        if missing_source {
            return Err(ConfigError::Invalid(
                "scheduler.source_base_url is required when the scheduler is enabled",
            ));
        }
    }
    Ok(())
}

/// A complete, valid sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

bus:
  favorites_topic: "FAVORITE_PRODUCTS"

gateway:
  base_url: "http://127.0.0.1:8083/"
  timeout_ms: 5000

scheduler:
  enabled: false
  interval_secs: 60
  source_base_url: "http://127.0.0.1:8081/"
"#
}
