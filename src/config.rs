//! Bridge configuration.
//!
//! Loaded once at startup from a TOML file and passed by value into the
//! components; nothing here mutates after construction. Sections mirror the
//! deployment surface: `[mqtt]` for the broker session, `[msgbus]` for topic
//! naming and heartbeats, `[http]`/`[tls]` for the intake listener,
//! `[dispatch]` for the intake queue, plus a top-level `apikeys` list.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::connector::ConnectorConfig;
use crate::intake::IntakeConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub msgbus: MsgbusSection,
    #[serde(default)]
    pub http: HttpSection,
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub apikeys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Defaults to a per-process id when left empty.
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MsgbusSection {
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Defaults to a freshly generated UUID when absent.
    pub nodename: Option<String>,
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_addr")]
    pub addr: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    /// Capacity of the intake-to-dispatch channel. Senders await when the
    /// queue is full, so webhook responses stall rather than drop events.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_server() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_domain() -> String {
    "domain".to_string()
}

fn default_status_interval() -> u64 {
    60
}

fn default_http_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    16
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_mqtt_port(),
            client_id: String::new(),
            keepalive: default_keepalive(),
        }
    }
}

impl Default for MsgbusSection {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            nodename: None,
            status_interval: default_status_interval(),
        }
    }
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
            port: default_http_port(),
            use_tls: false,
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.use_tls && self.tls.is_none() {
            return Err(ConfigError::Invalid(
                "http.use_tls is set but the [tls] section is missing".to_string(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.apikeys.is_empty() {
            warn!("no API keys configured, every intake request will be rejected");
        }
        Ok(())
    }

    /// Connector settings with the empty/absent identifiers resolved.
    pub fn connector_config(&self) -> ConnectorConfig {
        let client_id = if self.mqtt.client_id.is_empty() {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("hookbus-{secs}")
        } else {
            self.mqtt.client_id.clone()
        };

        let nodename = self
            .msgbus
            .nodename
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        ConnectorConfig {
            server: self.mqtt.server.clone(),
            port: self.mqtt.port,
            client_id,
            keepalive_secs: self.mqtt.keepalive,
            domain: self.msgbus.domain.clone(),
            nodename,
            status_interval_secs: self.msgbus.status_interval,
        }
    }

    pub fn intake_config(&self) -> IntakeConfig {
        IntakeConfig {
            addr: self.http.addr.clone(),
            port: self.http.port,
            use_tls: self.http.use_tls,
            cert_file: self.tls.as_ref().map(|t| t.cert.clone()),
            key_file: self.tls.as_ref().map(|t| t.key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let config = BridgeConfig::parse(
            r#"
            apikeys = ["abc", "def"]

            [mqtt]
            server = "broker.local"
            port = 8883
            client_id = "bridge-1"
            keepalive = 30

            [msgbus]
            domain = "home"
            nodename = "node1"
            status_interval = 15

            [http]
            addr = "127.0.0.1"
            port = 9000

            [dispatch]
            queue_capacity = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.server, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.msgbus.domain, "home");
        assert_eq!(config.msgbus.nodename.as_deref(), Some("node1"));
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.dispatch.queue_capacity, 4);
        assert_eq!(config.apikeys, vec!["abc", "def"]);

        let connector = config.connector_config();
        assert_eq!(connector.client_id, "bridge-1");
        assert_eq!(connector.nodename, "node1");
        assert_eq!(connector.status_interval_secs, 15);
    }

    #[test]
    fn test_defaults_apply_when_sections_absent() {
        let config = BridgeConfig::parse(r#"apikeys = ["k"]"#).unwrap();

        assert_eq!(config.mqtt.server, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive, 60);
        assert_eq!(config.msgbus.domain, "domain");
        assert_eq!(config.msgbus.status_interval, 60);
        assert_eq!(config.http.addr, "0.0.0.0");
        assert_eq!(config.http.port, 8080);
        assert!(!config.http.use_tls);
        assert_eq!(config.dispatch.queue_capacity, 16);
    }

    #[test]
    fn test_identifiers_are_generated_when_unset() {
        let config = BridgeConfig::parse("").unwrap();
        let connector = config.connector_config();

        assert!(connector.client_id.starts_with("hookbus-"));
        // nodename falls back to a fresh UUID
        assert!(uuid::Uuid::parse_str(&connector.nodename).is_ok());
    }

    #[test]
    fn test_tls_requires_cert_section() {
        let err = BridgeConfig::parse(
            r#"
            [http]
            use_tls = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = BridgeConfig::parse(
            r#"
            [http]
            use_tls = true

            [tls]
            cert = "/etc/hookbus/cert.pem"
            key = "/etc/hookbus/key.pem"
            "#,
        )
        .unwrap();
        let intake = config.intake_config();
        assert!(intake.use_tls);
        assert!(intake.cert_file.is_some());
    }

    #[test]
    fn test_zero_queue_capacity_is_rejected() {
        let err = BridgeConfig::parse(
            r#"
            [dispatch]
            queue_capacity = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
