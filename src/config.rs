//! Configuration system for the management broker
//!
//! The broker reads a single TOML file with a `[client]` section describing
//! this computer and its plugins, and an `[exchange]` section describing how
//! and how often to talk to the management server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main broker configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    pub client: ClientSection,
    pub exchange: ExchangeSection,
}

/// Client section: who this computer is and which plugins to load
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Human-readable title the computer registers under
    pub computer_title: String,
    /// Account the computer registers with
    #[serde(default)]
    pub account_name: String,
    /// Directory holding the durable message store
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Directory of annotation files reported by the computer-info plugin
    pub annotations_path: Option<PathBuf>,
    /// Location of the kernel memory summary
    #[serde(default = "default_meminfo_path")]
    pub meminfo_path: PathBuf,
    /// Names of the connectors to start, in order
    #[serde(default)]
    pub connectors: Vec<String>,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/mgmt-broker")
}

fn default_meminfo_path() -> PathBuf {
    PathBuf::from("/proc/meminfo")
}

/// Exchange section: server endpoints and cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeSection {
    /// Message system endpoint
    pub url: String,
    /// Liveness endpoint checked before each exchange
    pub ping_url: Option<String>,
    /// Normal exchange cadence in seconds (default: 900 = 15 minutes)
    #[serde(default = "default_exchange_interval")]
    pub exchange_interval_secs: u64,
    /// Cadence while an urgent exchange is pending (default: 60)
    #[serde(default = "default_urgent_exchange_interval")]
    pub urgent_exchange_interval_secs: u64,
    /// Upper bound on messages uploaded per round trip
    #[serde(default = "default_max_messages")]
    pub max_messages_per_exchange: usize,
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

fn default_exchange_interval() -> u64 {
    900 // 15 minutes
}

fn default_urgent_exchange_interval() -> u64 {
    60
}

fn default_max_messages() -> usize {
    100
}

fn default_exchange_timeout() -> u64 {
    60
}

fn default_ping_timeout() -> u64 {
    10
}

impl ExchangeSection {
    pub fn exchange_interval(&self) -> Duration {
        Duration::from_secs(self.exchange_interval_secs)
    }

    pub fn urgent_exchange_interval(&self) -> Duration {
        Duration::from_secs(self.urgent_exchange_interval_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Validate endpoints and intervals
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("exchange.url", &self.url)?;
        if let Some(ref ping_url) = self.ping_url {
            validate_url("exchange.ping_url", ping_url)?;
        }

        if self.exchange_interval_secs == 0 || self.urgent_exchange_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Exchange intervals must be positive".to_string(),
            ));
        }
        if self.urgent_exchange_interval_secs > self.exchange_interval_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "urgent_exchange_interval_secs ({}) must not exceed exchange_interval_secs ({})",
                self.urgent_exchange_interval_secs, self.exchange_interval_secs
            )));
        }
        if self.max_messages_per_exchange == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_messages_per_exchange must be positive".to_string(),
            ));
        }
        if self.exchange_timeout_secs == 0 || self.ping_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.computer_title.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client.computer_title must not be empty".to_string(),
            ));
        }
        self.exchange.validate()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[client]
computer_title = "test-computer"
account_name = "test-account"
data_path = "/tmp/mgmt-broker-test"

[exchange]
url = "http://localhost:8080/message-system"
exchange_interval_secs = 900
urgent_exchange_interval_secs = 60
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field: field.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            field: field.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[client]
computer_title = "web-01"
account_name = "acme"
data_path = "/srv/broker"
annotations_path = "/srv/broker/annotations"
meminfo_path = "/tmp/meminfo"
connectors = ["computer-info"]

[exchange]
url = "https://mgmt.example.com/message-system"
ping_url = "http://mgmt.example.com/ping"
exchange_interval_secs = 300
urgent_exchange_interval_secs = 30
max_messages_per_exchange = 50
exchange_timeout_secs = 20
ping_timeout_secs = 5
"#;

        let config = BrokerConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.client.computer_title, "web-01");
        assert_eq!(config.client.account_name, "acme");
        assert_eq!(config.client.data_path, PathBuf::from("/srv/broker"));
        assert_eq!(
            config.client.annotations_path,
            Some(PathBuf::from("/srv/broker/annotations"))
        );
        assert_eq!(config.client.connectors, vec!["computer-info".to_string()]);
        assert_eq!(config.exchange.exchange_interval(), Duration::from_secs(300));
        assert_eq!(
            config.exchange.urgent_exchange_interval(),
            Duration::from_secs(30)
        );
        assert_eq!(config.exchange.max_messages_per_exchange, 50);
        assert_eq!(config.exchange.exchange_timeout(), Duration::from_secs(20));
        assert_eq!(config.exchange.ping_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_applied() {
        let toml_content = r#"
[client]
computer_title = "web-01"

[exchange]
url = "https://mgmt.example.com/message-system"
"#;

        let config = BrokerConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.client.account_name, "");
        assert_eq!(config.client.data_path, default_data_path());
        assert_eq!(config.client.meminfo_path, PathBuf::from("/proc/meminfo"));
        assert!(config.client.connectors.is_empty());
        assert!(config.exchange.ping_url.is_none());
        assert_eq!(config.exchange.exchange_interval_secs, 900);
        assert_eq!(config.exchange.urgent_exchange_interval_secs, 60);
        assert_eq!(config.exchange.max_messages_per_exchange, 100);
        assert_eq!(config.exchange.exchange_timeout_secs, 60);
        assert_eq!(config.exchange.ping_timeout_secs, 10);
    }

    #[test]
    fn test_empty_title_rejected() {
        let toml_content = r#"
[client]
computer_title = "   "

[exchange]
url = "https://mgmt.example.com/message-system"
"#;

        let result = BrokerConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_url_rejected() {
        let toml_content = r#"
[client]
computer_title = "web-01"

[exchange]
url = "not a url"
"#;

        let result = BrokerConfig::from_toml_str(toml_content);
        assert!(
            matches!(result, Err(ConfigError::InvalidUrl { ref field, .. }) if field == "exchange.url")
        );
    }

    #[test]
    fn test_non_http_ping_url_rejected() {
        let toml_content = r#"
[client]
computer_title = "web-01"

[exchange]
url = "https://mgmt.example.com/message-system"
ping_url = "ftp://mgmt.example.com/ping"
"#;

        let result = BrokerConfig::from_toml_str(toml_content);
        assert!(
            matches!(result, Err(ConfigError::InvalidUrl { ref field, .. }) if field == "exchange.ping_url")
        );
    }

    #[test]
    fn test_urgent_interval_longer_than_normal_rejected() {
        let toml_content = r#"
[client]
computer_title = "web-01"

[exchange]
url = "https://mgmt.example.com/message-system"
exchange_interval_secs = 60
urgent_exchange_interval_secs = 120
"#;

        let result = BrokerConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = BrokerConfig::test_config();
        config.exchange.exchange_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_section_is_parse_error() {
        let result = BrokerConfig::from_toml_str("[client]\ncomputer_title = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
computer_title = "from-file"

[exchange]
url = "http://localhost:9000/message-system"
"#
        )
        .unwrap();

        let config = BrokerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.client.computer_title, "from-file");
    }

    #[test]
    fn test_load_missing_file() {
        let result = BrokerConfig::load_from_file(Path::new("/nonexistent/broker.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_test_config_is_valid() {
        let config = BrokerConfig::test_config();
        assert!(config.validate().is_ok());
    }
}
