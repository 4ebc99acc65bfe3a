//! Configuration file management for certmonger-exporter.
//!
//! Settings come from three places with clear precedence rules:
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file (specified with --config)
//! 3. Command-line arguments and `CERTMONGER_EXPORTER_*` environment variables
//!    (highest priority)
//!
//! # Example Configuration File
//!
//! ```toml
//! user = "nobody"
//! port = 9630
//! listen_address = "0.0.0.0"
//! log_level = "info"
//! scrape_timeout_secs = 30
//! shutdown_timeout_secs = 5
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_USER: &str = "nobody";
pub const DEFAULT_PORT: u16 = 9630;
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Main configuration structure.
///
/// All fields are optional to support partial configuration and merging.
/// Missing values fall back to the defaults above.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Unprivileged user the network-facing worker switches to
    pub user: Option<String>,
    /// HTTP port for the metrics endpoint
    pub port: Option<u16>,
    /// Address the metrics endpoint binds to
    pub listen_address: Option<String>,
    /// Log verbosity (error, warn, info, debug, trace)
    pub log_level: Option<String>,
    /// How long an HTTP scrape waits for a snapshot
    pub scrape_timeout_secs: Option<u64>,
    /// How long the supervisor waits for the worker to exit before killing it
    pub shutdown_timeout_secs: Option<u64>,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully parsed configuration
    /// * `Err(ConfigError::Io)` - File could not be read
    /// * `Err(ConfigError::Parse)` - File contains invalid TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Creates a configuration with every field set to its default.
    pub fn defaults() -> Self {
        Config {
            user: Some(DEFAULT_USER.to_string()),
            port: Some(DEFAULT_PORT),
            listen_address: Some(DEFAULT_LISTEN_ADDRESS.to_string()),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            scrape_timeout_secs: Some(DEFAULT_SCRAPE_TIMEOUT_SECS),
            shutdown_timeout_secs: Some(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    /// Merges this configuration with another, prioritizing the other's values.
    ///
    /// For each field, if the `other` config has a value (Some), it overrides
    /// this config's value. If the `other` value is None, keeps the current value.
    pub fn merge_with(mut self, other: Config) -> Self {
        if other.user.is_some() {
            self.user = other.user;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.listen_address.is_some() {
            self.listen_address = other.listen_address;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
        if other.scrape_timeout_secs.is_some() {
            self.scrape_timeout_secs = other.scrape_timeout_secs;
        }
        if other.shutdown_timeout_secs.is_some() {
            self.shutdown_timeout_secs = other.shutdown_timeout_secs;
        }
        self
    }

    /// Creates a Config from command-line arguments for merging.
    ///
    /// Only provided arguments (Some values) will override other configurations.
    pub fn from_cli_args(
        user: Option<String>,
        port: Option<u16>,
        listen_address: Option<String>,
        log_level: Option<String>,
        scrape_timeout_secs: Option<u64>,
        shutdown_timeout_secs: Option<u64>,
    ) -> Self {
        Config {
            user,
            port,
            listen_address,
            log_level,
            scrape_timeout_secs,
            shutdown_timeout_secs,
        }
    }

    /// Checks that the merged configuration can actually be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user().is_empty() {
            return Err(ConfigError::Validation("user must not be empty".to_string()));
        }
        if self.port() == 0 {
            return Err(ConfigError::Validation("port must not be 0".to_string()));
        }
        if self.listen_address().parse::<IpAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "listen_address '{}' is not an IP address",
                self.listen_address()
            )));
        }
        if self.scrape_timeout_secs == Some(0) || self.shutdown_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn listen_address(&self) -> &str {
        self.listen_address
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDRESS)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(
            self.scrape_timeout_secs
                .unwrap_or(DEFAULT_SCRAPE_TIMEOUT_SECS),
        )
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(
            self.shutdown_timeout_secs
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        )
    }

    /// Generates an example configuration file in TOML format.
    pub fn example_toml() -> String {
        toml::to_string_pretty(&Config::defaults())
            .unwrap_or_else(|_| "# Error generating example".to_string())
    }
}

/// Errors that can occur during configuration loading and parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("IO Error: {0}")]
    Io(String),
    /// TOML parsing error (invalid syntax, type mismatch, etc.)
    #[error("Parse Error: {0}")]
    Parse(String),
    /// Validation error (empty user, port 0, etc.)
    #[error("Validation Error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_from_toml() {
        let toml_content = r#"
            user = "certmonger-exporter"
            port = 9631
            listen_address = "127.0.0.1"
            log_level = "debug"
            shutdown_timeout_secs = 10
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.user, Some("certmonger-exporter".to_string()));
        assert_eq!(config.port, Some(9631));
        assert_eq!(config.listen_address, Some("127.0.0.1".to_string()));
        assert_eq!(config.log_level, Some("debug".to_string()));
        assert_eq!(config.scrape_timeout_secs, None);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_merge() {
        let base_config = Config::defaults();

        let override_config = Config {
            user: Some("exporter".to_string()),
            port: None,
            listen_address: None,
            log_level: Some("debug".to_string()),
            scrape_timeout_secs: Some(5),
            shutdown_timeout_secs: None,
        };

        let merged = base_config.merge_with(override_config);

        assert_eq!(merged.user(), "exporter");
        assert_eq!(merged.port(), DEFAULT_PORT); // From base (not overridden)
        assert_eq!(merged.log_level(), "debug");
        assert_eq!(merged.scrape_timeout(), Duration::from_secs(5));
        assert_eq!(
            merged.shutdown_timeout(),
            Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();

        assert_eq!(config.user(), "nobody");
        assert_eq!(config.port(), 9630);
        assert_eq!(config.listen_address(), "0.0.0.0");
        assert_eq!(config.log_level(), "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_falls_back_to_defaults() {
        let config = Config::default();
        assert_eq!(config.user(), DEFAULT_USER);
        assert_eq!(config.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_config_from_cli_args() {
        let config = Config::from_cli_args(
            Some("daemon".to_string()),
            Some(19630),
            None,
            None,
            None,
            Some(2),
        );

        assert_eq!(config.user, Some("daemon".to_string()));
        assert_eq!(config.port, Some(19630));
        assert_eq!(config.listen_address, None);
        assert_eq!(config.shutdown_timeout_secs, Some(2));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_port = Config::defaults().merge_with(Config {
            port: Some(0),
            ..Config::default()
        });
        assert!(matches!(
            zero_port.validate(),
            Err(ConfigError::Validation(_))
        ));

        let bad_address = Config::defaults().merge_with(Config {
            listen_address: Some("localhost:9630".to_string()),
            ..Config::default()
        });
        assert!(bad_address.validate().is_err());

        let zero_timeout = Config::defaults().merge_with(Config {
            shutdown_timeout_secs: Some(0),
            ..Config::default()
        });
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let invalid_toml = "port = [invalid toml";

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        let result = Config::from_file(temp_file.path());
        assert!(result.is_err());

        match result.unwrap_err() {
            ConfigError::Parse(_) => {} // Expected
            other => panic!("Expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn test_example_toml_generation() {
        let example = Config::example_toml();

        // Should be valid TOML
        let parsed: Config = toml::from_str(&example).unwrap();

        assert_eq!(parsed, Config::defaults());
    }
}
