//! Configuration types, defaults, and loading.
//!
//! Grounded: `examples/adolfousier-opencrabs/src/config/types.rs` — nested
//! `#[serde(default)]` sections, `default_*()` free functions feeding
//! `#[serde(default = "...")]`, and a top-level `Config::load` that layers
//! file + environment via the `config` crate.

use super::secrets::SecretString;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub triggers: TriggersConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

impl Config {
    /// Loads configuration from `<config_dir>/config.toml` layered with
    /// `CONVEXEC_*` environment overrides, falling back to defaults when no
    /// file is present.
    pub fn load(config_dir: Option<&Path>) -> Result<Self> {
        let dir = match config_dir {
            Some(d) => d.to_path_buf(),
            None => default_config_dir(),
        };
        let file_path = dir.join("config.toml");

        let builder = config::Config::builder()
            .add_source(config::File::from(file_path).required(false))
            .add_source(config::Environment::with_prefix("CONVEXEC").separator("__"));

        let raw = builder.build().context("building layered configuration")?;
        let cfg: Config = raw
            .try_deserialize()
            .context("deserializing layered configuration")?;
        Ok(cfg)
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convexec")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    default_config_dir().join("convexec.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Bind address/port for the webhook gateway (§6 external interfaces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: Option<ProviderConfig>,
    #[serde(default)]
    pub openai_compatible: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<SecretString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Billing/credit deduction configuration (§4.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// When true, `check_and_reserve_credits` always succeeds and `deduct`
    /// is a no-op. Mirrors the original's dev-mode bypass.
    #[serde(default)]
    pub dev_mode: bool,
    /// Path to a TOML pricing table overriding the compiled-in default.
    #[serde(default)]
    pub pricing_path: Option<PathBuf>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            pricing_path: None,
        }
    }
}

/// Trigger/execution-service configuration (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    /// Shared webhook-standard signing secret, tried in ascii/hex/base64
    /// encodings by the verifier.
    #[serde(default)]
    pub webhook_secret: Option<SecretString>,
    /// Allowed clock skew in seconds for webhook timestamp verification.
    #[serde(default = "default_skew_secs")]
    pub skew_secs: i64,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            skew_secs: default_skew_secs(),
        }
    }
}

fn default_skew_secs() -> i64 {
    300
}

/// Context Manager tuning knobs, with defaults matching §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_keep_tool_results")]
    pub keep_tool_results: usize,
    #[serde(default = "default_keep_user_messages")]
    pub keep_user_messages: usize,
    #[serde(default = "default_keep_assistant_messages")]
    pub keep_assistant_messages: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_min_keep")]
    pub min_keep: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            keep_tool_results: default_keep_tool_results(),
            keep_user_messages: default_keep_user_messages(),
            keep_assistant_messages: default_keep_assistant_messages(),
            max_messages: default_max_messages(),
            max_iterations: default_max_iterations(),
            min_keep: default_min_keep(),
        }
    }
}

fn default_keep_tool_results() -> usize {
    5
}
fn default_keep_user_messages() -> usize {
    10
}
fn default_keep_assistant_messages() -> usize {
    10
}
fn default_max_messages() -> usize {
    320
}
fn default_max_iterations() -> u32 {
    3
}
fn default_min_keep() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = ContextConfig::default();
        assert_eq!(cfg.keep_tool_results, 5);
        assert_eq!(cfg.keep_user_messages, 10);
        assert_eq!(cfg.keep_assistant_messages, 10);
        assert_eq!(cfg.max_messages, 320);
        assert_eq!(cfg.min_keep, 10);
    }

    #[test]
    fn triggers_default_skew_is_300s() {
        assert_eq!(TriggersConfig::default().skew_secs, 300);
    }
}
