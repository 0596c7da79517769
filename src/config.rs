//! Configuration module for the sstunnel client core
//!
//! TOML-based settings for operation timeouts, reconnection policy, dynamic
//! key fetching and logging.

use crate::error::{IntoVpnError, Result, VpnError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Per-operation timeouts, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Backend `connect` call, including its connectivity check
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,
    /// Backend `disconnect` call
    #[serde(default = "default_stop_timeout")]
    pub stop_ms: u64,
    /// Reachability probe during reconnection
    #[serde(default = "default_probe_timeout")]
    pub probe_ms: u64,
    /// Dynamic access key fetch
    #[serde(default = "default_fetch_timeout")]
    pub fetch_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            stop_ms: default_stop_timeout(),
            probe_ms: default_probe_timeout(),
            fetch_ms: default_fetch_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_millis(self.stop_ms)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_millis(self.fetch_ms)
    }
}

/// Reconnection episode policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum probes per episode before the tunnel is torn down
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u32,
    /// Delay between probes in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl ReconnectConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// HTTP settings for dynamic access key fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Accept self-signed config servers
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            accept_invalid_certs: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        let config = <Self as FromStr>::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).into_vpn_error("Failed to serialize config")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("connect_ms", self.timeouts.connect_ms),
            ("stop_ms", self.timeouts.stop_ms),
            ("probe_ms", self.timeouts.probe_ms),
            ("fetch_ms", self.timeouts.fetch_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(VpnError::Config(format!(
                    "Timeout {name} cannot be zero"
                )));
            }
        }

        if self.reconnect.max_retry_attempts == 0 {
            return Err(VpnError::Config(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.fetch.user_agent.trim().is_empty() {
            return Err(VpnError::Config("User agent cannot be empty".to_string()));
        }

        match self.logging.level.to_ascii_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" | "off" => Ok(()),
            other => Err(VpnError::Config(format!("Unknown log level '{other}'"))),
        }
    }
}

impl FromStr for Config {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VpnError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_connect_timeout() -> u64 {
    30_000
}

fn default_stop_timeout() -> u64 {
    10_000
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_fetch_timeout() -> u64 {
    20_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_delay() -> u64 {
    2_000
}

fn default_user_agent() -> String {
    format!("sstunnel/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
[timeouts]
connect_ms = 15000
probe_ms = 1000

[reconnect]
max_retry_attempts = 4
retry_delay_ms = 250

[logging]
level = "debug"
"#;

        let config = toml_content
            .parse::<Config>()
            .expect("Failed to parse config");
        assert_eq!(config.timeouts.connect(), Duration::from_secs(15));
        assert_eq!(config.timeouts.probe(), Duration::from_secs(1));
        assert_eq!(config.timeouts.stop_ms, 10_000);
        assert_eq!(config.reconnect.max_retry_attempts, 4);
        assert_eq!(config.reconnect.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.logging.level, "debug");
        assert!(!config.fetch.accept_invalid_certs);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = "".parse().expect("empty config");
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.timeouts.connect_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let mut config = Config::default();
        config.reconnect.max_retry_attempts = 7;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(config.to_toml().expect("serialize").as_bytes())
            .expect("write");

        let loaded = Config::from_file(file.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/nonexistent/sstunnel.toml").unwrap_err();
        assert!(matches!(err, VpnError::Config(_)));
    }
}
