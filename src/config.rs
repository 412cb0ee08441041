//! Configuration management for storyrelay
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for storyrelay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream provider settings
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Session and streaming behavior
    #[serde(default)]
    pub relay: RelayConfig,
    /// Document and audit storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Streaming generation endpoint (POST target)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Use case sent with every request
    #[serde(default = "default_usecase")]
    pub usecase: String,

    /// Model used when a request does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Instruction used when a request does not carry one
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Per-provider API keys forwarded in the caller block
    #[serde(default = "default_api_keys")]
    pub api_keys: BTreeMap<String, String>,
}

fn default_endpoint() -> String {
    "http://python-app:5000/api/stream".to_string()
}

fn default_usecase() -> String {
    "story".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_instruction() -> String {
    "Continue the story in a coherent and engaging way, maintaining the same style, tone, \
     and narrative voice."
        .to_string()
}

fn default_api_keys() -> BTreeMap<String, String> {
    ["openai", "gemini", "deepseek"]
        .iter()
        .map(|name| (name.to_string(), String::new()))
        .collect()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            usecase: default_usecase(),
            default_model: default_model(),
            instruction: default_instruction(),
            api_keys: default_api_keys(),
        }
    }
}

/// Session and streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Overall bound on a session, connection included (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Bound on establishing the upstream connection (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Per-topic broadcast buffer; slower subscribers lose the oldest events
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Attempts at a versioned document write before giving up
    #[serde(default = "default_merge_max_retries")]
    pub merge_max_retries: usize,
}

fn default_timeout() -> u64 {
    180
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    256
}

fn default_merge_max_retries() -> usize {
    16
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            channel_capacity: default_channel_capacity(),
            merge_max_retries: default_merge_max_retries(),
        }
    }
}

impl RelayConfig {
    /// Overall session deadline as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Connection deadline as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the chapter document database
    #[serde(default = "default_content_path")]
    pub content_path: PathBuf,

    /// Directory of the session audit database
    #[serde(default = "default_audit_path")]
    pub audit_path: PathBuf,

    /// Use throwaway databases that are removed on drop
    #[serde(default)]
    pub temporary: bool,
}

fn default_content_path() -> PathBuf {
    PathBuf::from("data/content.db")
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("data/audit.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            content_path: default_content_path(),
            audit_path: default_audit_path(),
            temporary: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,

    /// Also append logs to this file
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "storyrelay=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(endpoint) = std::env::var("STORYRELAY_PROVIDER_ENDPOINT") {
            self.provider.endpoint = endpoint;
        }

        if let Ok(model) = std::env::var("STORYRELAY_DEFAULT_MODEL") {
            self.provider.default_model = model;
        }

        for provider in ["openai", "gemini", "deepseek"] {
            let var = format!("STORYRELAY_{}_API_KEY", provider.to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                self.provider.api_keys.insert(provider.to_string(), key);
            }
        }

        if let Ok(timeout) = std::env::var("STORYRELAY_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.relay.timeout_seconds = value;
            } else {
                tracing::warn!("Invalid STORYRELAY_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(path) = std::env::var("STORYRELAY_CONTENT_DB") {
            self.storage.content_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("STORYRELAY_AUDIT_DB") {
            self.storage.audit_path = PathBuf::from(path);
        }

        if let Ok(bind) = std::env::var("STORYRELAY_BIND") {
            self.server.bind = bind;
        }

        if let Ok(level) = std::env::var("STORYRELAY_LOG_LEVEL") {
            tracing::debug!(level = %level, "Env override: STORYRELAY_LOG_LEVEL");
            self.logging.level = level;
        }

        if let Ok(json_logs) = std::env::var("STORYRELAY_JSON_LOGS") {
            match json_logs.parse::<bool>() {
                Ok(v) => self.logging.json_format = v,
                Err(_) => {
                    tracing::warn!("Invalid value for STORYRELAY_JSON_LOGS: {}", json_logs);
                }
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "storyrelay=debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let endpoint = url::Url::parse(&self.provider.endpoint).map_err(|e| {
            RelayError::Config(format!(
                "provider.endpoint is not a valid URL ({}): {}",
                self.provider.endpoint, e
            ))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "provider.endpoint must use http or https, got {}",
                endpoint.scheme()
            ))
            .into());
        }

        if self.provider.usecase.trim().is_empty() {
            return Err(
                RelayError::Config("provider.usecase cannot be empty".to_string()).into(),
            );
        }

        if self.relay.timeout_seconds == 0 {
            return Err(RelayError::Config(
                "relay.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.relay.connect_timeout_seconds == 0 {
            return Err(RelayError::Config(
                "relay.connect_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.relay.connect_timeout_seconds > self.relay.timeout_seconds {
            return Err(RelayError::Config(
                "relay.connect_timeout_seconds must not exceed relay.timeout_seconds".to_string(),
            )
            .into());
        }

        if self.relay.channel_capacity == 0 {
            return Err(RelayError::Config(
                "relay.channel_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.relay.merge_max_retries == 0 {
            return Err(RelayError::Config(
                "relay.merge_max_retries must be greater than 0".to_string(),
            )
            .into());
        }

        self.server.bind.parse::<SocketAddr>().map_err(|e| {
            RelayError::Config(format!(
                "server.bind is not a socket address ({}): {}",
                self.server.bind, e
            ))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider.usecase, "story");
        assert_eq!(config.provider.default_model, "gpt-4o-mini");
        assert_eq!(config.relay.timeout_seconds, 180);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(config.provider.api_keys.contains_key("gemini"));
    }

    #[test]
    fn test_config_validation_success() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_bad_endpoint() {
        let mut config = Config::default();
        config.provider.endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        config.provider.endpoint = "ftp://example.com/stream".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = Config::default();
        config.relay.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_connect_exceeds_total() {
        let mut config = Config::default();
        config.relay.timeout_seconds = 5;
        config.relay.connect_timeout_seconds = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_config_validation_zero_capacity() {
        let mut config = Config::default();
        config.relay.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_bind() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
provider:
  endpoint: http://localhost:5000/api/stream
  default_model: gemini-1.5-flash
relay:
  timeout_seconds: 60
storage:
  temporary: true
logging:
  json_format: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.provider.endpoint, "http://localhost:5000/api/stream");
        assert_eq!(config.provider.default_model, "gemini-1.5-flash");
        assert_eq!(config.provider.usecase, "story");
        assert_eq!(config.relay.timeout_seconds, 60);
        assert_eq!(config.relay.connect_timeout_seconds, 10);
        assert!(config.storage.temporary);
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_file_uses_defaults() {
        let cli = crate::cli::Cli::default();
        let config = Config::load("/nonexistent/storyrelay.yaml", &cli).unwrap();
        assert_eq!(config.relay.channel_capacity, 256);
    }

    #[test]
    fn test_verbose_flag_raises_log_level() {
        let cli = crate::cli::Cli {
            verbose: true,
            ..crate::cli::Cli::default()
        };
        let config = Config::load("/nonexistent/storyrelay.yaml", &cli).unwrap();
        assert_eq!(config.logging.level, "storyrelay=debug");
    }

    #[test]
    fn test_duration_helpers() {
        let relay = RelayConfig::default();
        assert_eq!(relay.timeout(), Duration::from_secs(180));
        assert_eq!(relay.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    #[serial_test::serial]
    fn test_apply_env_vars_overrides() {
        std::env::set_var("STORYRELAY_TIMEOUT_SECONDS", "42");
        std::env::set_var("STORYRELAY_OPENAI_API_KEY", "sk-test");
        let mut config = Config::default();
        config.apply_env_vars();
        std::env::remove_var("STORYRELAY_TIMEOUT_SECONDS");
        std::env::remove_var("STORYRELAY_OPENAI_API_KEY");

        assert_eq!(config.relay.timeout_seconds, 42);
        assert_eq!(config.provider.api_keys.get("openai").unwrap(), "sk-test");
    }

    #[test]
    #[serial_test::serial]
    fn test_apply_env_vars_ignores_invalid_timeout() {
        std::env::set_var("STORYRELAY_TIMEOUT_SECONDS", "soon");
        let mut config = Config::default();
        config.apply_env_vars();
        std::env::remove_var("STORYRELAY_TIMEOUT_SECONDS");

        assert_eq!(config.relay.timeout_seconds, 180);
    }
}
