//! Layered configuration.
//!
//! Later layers override earlier ones:
//! 1. Compiled defaults
//! 2. `~/.config/courier/courier.toml`, then `./courier.toml` (or one explicit file)
//! 3. `COURIER_*` environment variables
//! 4. Command-line flags

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::RetryPolicy;
use crate::core::plan::{DEFAULT_CHUNK_SIZE, MAX_CONCURRENCY, validate_chunk_size};
use crate::logging::LogConfig;
use crate::remote::AppType;
use crate::session::{ClockSource, SessionOptions, SntpClock, SystemClock};
use crate::storage::{StorageLocation, validate_namespace};

const CONFIG_FILE: &str = "courier.toml";
const PROXY_SCHEMES: [&str; 3] = ["socks5", "http", "https"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(Box<figment::Error>),
    #[error("config file {} does not exist", .0.display())]
    MissingFile(PathBuf),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database; defaults to `<data_dir>/data.db`.
    pub path: Option<PathBuf>,
    /// Directory of the legacy key-per-file store; defaults to `<data_dir>/legacy`.
    pub legacy_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_flood_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_flood_retries: policy.max_flood_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// Account namespace used when a command does not name one.
    pub namespace: String,
    /// `socks5://`, `http://` or `https://` proxy URL.
    pub proxy: Option<String>,
    pub reconnect_timeout_secs: u64,
    /// SNTP server used to measure clock skew; the local clock is trusted when unset.
    pub ntp: Option<String>,
    pub app: AppType,
    /// Worker pool size per run.
    pub threads: usize,
    pub chunk_size: u32,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("courier"),
            namespace: "default".to_string(),
            proxy: None,
            reconnect_timeout_secs: 300,
            ntp: None,
            app: AppType::default(),
            threads: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Maps `COURIER_RETRY_MAX_ATTEMPTS` to `retry.max_attempts` and so on.
///
/// Only the section prefix is split, since field names contain underscores.
fn env_key(key: &str) -> String {
    for section in ["storage_", "retry_", "log_"] {
        if let Some(field) = key.strip_prefix(section) {
            return format!("{}.{}", section.trim_end_matches('_'), field);
        }
    }
    key.to_string()
}

fn env_provider() -> Env {
    Env::prefixed("COURIER_").map(|key| env_key(key.as_str()).into())
}

impl AppConfig {
    /// Load every layer. `file` replaces the default file lookup; it must exist.
    /// `overrides` is merged last and should skip unset fields.
    pub fn load<T: Serialize>(
        file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));

        figment = match file {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::MissingFile(path.to_path_buf()));
                }
                figment.merge(Toml::file(path))
            }
            None => figment
                .merge(Toml::file(
                    dirs::config_dir()
                        .map(|d| d.join("courier").join(CONFIG_FILE))
                        .unwrap_or_default(),
                ))
                .merge(Toml::file(CONFIG_FILE)),
        };

        figment = figment.merge(env_provider());
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        Ok(figment.extract()?)
    }

    /// Defaults plus `toml`, without touching the filesystem or environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()?)
    }

    /// Every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if let Err(e) = validate_namespace(&self.namespace) {
            errors.push(invalid("namespace", e.to_string()));
        }
        if let Some(proxy) = &self.proxy {
            if let Err(reason) = check_proxy(proxy) {
                errors.push(invalid("proxy", reason));
            }
        }
        if self.reconnect_timeout_secs == 0 {
            errors.push(invalid("reconnect_timeout_secs", "must be positive"));
        }
        if self.ntp.as_deref().is_some_and(|s| s.trim().is_empty()) {
            errors.push(invalid("ntp", "server name is empty"));
        }
        if self.threads == 0 || self.threads > MAX_CONCURRENCY {
            errors.push(invalid(
                "threads",
                format!("must be between 1 and {MAX_CONCURRENCY}, got {}", self.threads),
            ));
        }
        if let Err(e) = validate_chunk_size(self.chunk_size) {
            errors.push(invalid("chunk_size", e.to_string()));
        }
        if self.retry.max_attempts == 0 {
            errors.push(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(invalid(
                "retry.base_delay_ms",
                format!("exceeds retry.max_delay_ms ({})", self.retry.max_delay_ms),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn storage_location(&self) -> StorageLocation {
        StorageLocation {
            path: self
                .storage
                .path
                .clone()
                .unwrap_or_else(|| self.data_dir.join("data.db")),
            legacy_dir: Some(
                self.storage
                    .legacy_dir
                    .clone()
                    .unwrap_or_else(|| self.data_dir.join("legacy")),
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_flood_retries: self.retry.max_flood_retries,
        }
    }

    pub fn session_options(&self, takeout: bool) -> SessionOptions {
        let clock: Arc<dyn ClockSource> = match &self.ntp {
            Some(server) => Arc::new(SntpClock::new(server.clone())),
            None => Arc::new(SystemClock),
        };
        SessionOptions {
            proxy: self.proxy.clone(),
            reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
            clock,
            takeout,
            app: self.app,
            retry: self.retry_policy(),
        }
    }

    /// Render as TOML, for `courier config`.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn check_proxy(proxy: &str) -> Result<(), String> {
    let Some((scheme, rest)) = proxy.split_once("://") else {
        return Err(format!("'{proxy}' is not a URL"));
    };
    if !PROXY_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
        return Err(format!(
            "unsupported scheme '{scheme}', expected one of {}",
            PROXY_SCHEMES.join(", ")
        ));
    }
    let host = rest.rsplit('@').next().unwrap_or(rest);
    if host.is_empty() || host.starts_with(':') {
        return Err("missing host".to_string());
    }
    Ok(())
}
