//! Session configuration
//!
//! `MqttConfig` is plain data: it can be built in code or loaded from TOML,
//! is validated once, and is moved into the session on construction. After
//! that nothing can change it.

use crate::protocol::codes::{EngineStatus, Qos};
use crate::protocol::topics::{
    validate_client_id, validate_topic_name, ValidationError, MQTT_V31_CLIENT_ID_MAX,
};
use crate::session::reconnect::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Complete configuration of one broker session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    /// Client identifier; empty means "generate one" (clean sessions only)
    #[serde(default)]
    pub client_id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub client_id_policy: ClientIdPolicy,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    pub will: Option<LastWill>,
    pub credentials: Option<Credentials>,
    pub publish: Option<PublishTuning>,
    pub server_cert: Option<ServerCert>,
    pub client_cert: Option<ClientCert>,
    pub tls: Option<TlsOptions>,
    pub psk: Option<Psk>,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u16 {
    60
}

fn default_clean_session() -> bool {
    true
}

/// MQTT protocol revision requested from the engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V31,
    #[default]
    V311,
}

/// How strictly the client identifier length is checked locally
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientIdPolicy {
    /// Enforce the MQTT 3.1 limit of 23 characters
    Strict,
    /// Leave it to the broker
    #[default]
    BrokerDefined,
}

impl ClientIdPolicy {
    pub fn max_len(self) -> Option<usize> {
        match self {
            ClientIdPolicy::Strict => Some(MQTT_V31_CLIENT_ID_MAX),
            ClientIdPolicy::BrokerDefined => None,
        }
    }
}

/// Message the broker publishes if the session dies unexpectedly
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWill {
    pub topic: String,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
}

impl LastWill {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: Qos,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// Username/password authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    /// Environment variable holding the password, used when `password` is unset
    pub password_env: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            password_env: None,
        }
    }

    /// Copy with `password_env` resolved into `password`
    pub fn resolved(&self) -> Result<Self, ConfigError> {
        let mut resolved = self.clone();
        if resolved.password.is_none() {
            if let Some(env_name) = &resolved.password_env {
                let password = std::env::var(env_name)
                    .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?;
                resolved.password = Some(password);
            }
        }
        Ok(resolved)
    }
}

/// Flow-control knobs for outgoing publishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishTuning {
    pub max_inflight_messages: u32,
    pub message_retry_secs: u32,
}

/// Trust anchors for verifying the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerCert {
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
}

/// Certificate presented to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCert {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub key_passphrase: Option<String>,
}

/// Peer verification mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CertReqs {
    VerifyNone,
    #[default]
    VerifyPeer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TlsOptions {
    /// Skip hostname verification
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub cert_reqs: CertReqs,
    pub tls_version: Option<String>,
    pub ciphers: Option<String>,
}

/// Pre-shared key TLS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Psk {
    /// Key in hexadecimal
    pub key: String,
    pub identity: String,
    pub ciphers: Option<String>,
}

/// Configuration loading and staging errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(#[source] ValidationError),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[source] ValidationError),
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Certificate path does not exist: {}", .0.display())]
    CertificateNotFound(PathBuf),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Engine rejected {option}: {status}")]
    Rejected {
        option: &'static str,
        status: EngineStatus,
    },
}

impl MqttConfig {
    /// Configuration with defaults for everything but the endpoint
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        keep_alive_secs: u16,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            keep_alive_secs,
            clean_session: default_clean_session(),
            protocol_version: ProtocolVersion::default(),
            client_id_policy: ClientIdPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            will: None,
            credentials: None,
            publish: None,
            server_cert: None,
            client_cert: None,
            tls: None,
            psk: None,
        }
    }

    /// Build from a broker URL.
    ///
    /// `mqtt://` and `tcp://` default to port 1883; `mqtts://` and `ssl://`
    /// default to 8883 and enable TLS with system trust roots. Credentials in
    /// the URL are picked up.
    pub fn from_url(client_id: impl Into<String>, broker_url: &str) -> Result<Self, ConfigError> {
        let url =
            Url::parse(broker_url).map_err(|_| ConfigError::InvalidUrl(broker_url.to_string()))?;
        let secure = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidUrl(broker_url.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

        let mut config = Self::new(client_id, host, port, default_keep_alive());
        if secure {
            config.tls = Some(TlsOptions::default());
        }
        if !url.username().is_empty() {
            config.credentials = Some(Credentials {
                username: url.username().to_string(),
                password: url.password().map(str::to_string),
                password_env: None,
            });
        }
        Ok(config)
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: MqttConfig = toml::from_str(&content)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve `password_env` into the password
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(resolved) = self.credentials.as_ref().map(Credentials::resolved).transpose()? {
            self.credentials = Some(resolved);
        }
        Ok(())
    }

    /// Reject invalid or contradictory settings before any network attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig("port must not be 0".to_string()));
        }

        validate_client_id(&self.client_id, self.client_id_policy.max_len())
            .map_err(ConfigError::InvalidClientId)?;
        if self.client_id.is_empty() && !self.clean_session {
            return Err(ConfigError::InvalidConfig(
                "an empty client_id requires clean_session = true".to_string(),
            ));
        }

        self.reconnect.validate().map_err(ConfigError::InvalidConfig)?;

        if let Some(will) = &self.will {
            validate_topic_name(&will.topic).map_err(ConfigError::InvalidTopic)?;
        }

        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "credentials.username must not be empty".to_string(),
                ));
            }
        }

        if let Some(publish) = &self.publish {
            if publish.max_inflight_messages > u32::from(u16::MAX) {
                return Err(ConfigError::InvalidConfig(format!(
                    "max_inflight_messages {} exceeds {}",
                    publish.max_inflight_messages,
                    u16::MAX
                )));
            }
        }

        self.validate_certificates()?;
        self.validate_psk()?;
        Ok(())
    }

    fn validate_certificates(&self) -> Result<(), ConfigError> {
        if let Some(server) = &self.server_cert {
            if server.ca_file.is_none() && server.ca_path.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "server_cert needs ca_file or ca_path".to_string(),
                ));
            }
            for path in server.ca_file.iter().chain(server.ca_path.iter()) {
                require_exists(path)?;
            }
        }

        if let Some(client) = &self.client_cert {
            if self.server_cert.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "client_cert requires server_cert".to_string(),
                ));
            }
            if client.cert_file.as_os_str().is_empty() || client.key_file.as_os_str().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "client_cert needs both cert_file and key_file".to_string(),
                ));
            }
            require_exists(&client.cert_file)?;
            require_exists(&client.key_file)?;
        }
        Ok(())
    }

    fn validate_psk(&self) -> Result<(), ConfigError> {
        let Some(psk) = &self.psk else {
            return Ok(());
        };
        if self.server_cert.is_some() || self.client_cert.is_some() {
            return Err(ConfigError::InvalidConfig(
                "psk cannot be combined with certificates".to_string(),
            ));
        }
        if psk.identity.is_empty() {
            return Err(ConfigError::InvalidConfig("psk.identity must not be empty".to_string()));
        }
        if psk.key.is_empty() || !psk.key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidConfig("psk.key must be hexadecimal".to_string()));
        }
        Ok(())
    }

    /// Client id handed to the engine; generated when left empty.
    ///
    /// Under [`ClientIdPolicy::Strict`] the generated id is bare hex cut to
    /// the length limit.
    pub fn effective_client_id(&self) -> String {
        if !self.client_id.is_empty() {
            return self.client_id.clone();
        }
        let unique = uuid::Uuid::new_v4().simple().to_string();
        match self.client_id_policy.max_len() {
            Some(max) => unique.chars().take(max).collect(),
            None => format!("mqtt-session/{unique}"),
        }
    }

    /// Whether any transport security block is present
    pub fn uses_tls(&self) -> bool {
        self.server_cert.is_some()
            || self.client_cert.is_some()
            || self.tls.is_some()
            || self.psk.is_some()
    }
}

fn require_exists(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConfigError::CertificateNotFound(path.to_path_buf()))
    }
}

/// Will payloads may be written as a string or as a byte array in TOML
mod payload_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Payload::deserialize(deserializer)? {
            Payload::Text(text) => text.into_bytes(),
            Payload::Bytes(bytes) => bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config() {
        let toml_content = r#"
host = "localhost"
"#;
        let config: MqttConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 60);
        assert!(config.clean_session);
        assert_eq!(config.protocol_version, ProtocolVersion::V311);
        assert_eq!(config.client_id_policy, ClientIdPolicy::BrokerDefined);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
client_id = "sensor-7"
host = "broker.local"
port = 1884
keep_alive_secs = 30
clean_session = false
protocol_version = "v31"
client_id_policy = "strict"

[reconnect]
mode = "backoff"
initial_delay_secs = 2
max_delay_secs = 60
exponential_backoff = false

[will]
topic = "sensors/7/status"
payload = "offline"
qos = "at_least_once"
retain = true

[credentials]
username = "alice"
password = "secret"

[publish]
max_inflight_messages = 10
message_retry_secs = 20
"#;
        let config: MqttConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.client_id, "sensor-7");
        assert_eq!(config.protocol_version, ProtocolVersion::V31);
        assert_eq!(config.client_id_policy, ClientIdPolicy::Strict);
        let will = config.will.as_ref().unwrap();
        assert_eq!(will.payload, b"offline".to_vec());
        assert_eq!(will.qos, Qos::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(config.publish.unwrap().max_inflight_messages, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_will_payload_as_bytes() {
        let toml_content = r#"
host = "localhost"
[will]
topic = "t"
payload = [0, 1, 0, 0]
"#;
        let config: MqttConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.will.unwrap().payload, vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_from_url() {
        let config = MqttConfig::from_url("c1", "mqtt://example.com").unwrap();
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 1883);
        assert!(config.tls.is_none());

        let config = MqttConfig::from_url("c1", "mqtts://user:pw@example.com").unwrap();
        assert_eq!(config.port, 8883);
        assert!(config.tls.is_some());
        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.username, "user");
        assert_eq!(credentials.password.as_deref(), Some("pw"));

        assert!(matches!(
            MqttConfig::from_url("c1", "http://example.com"),
            Err(ConfigError::InvalidUrl(_))
        ));
        assert!(matches!(
            MqttConfig::from_url("c1", "not a url"),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_strict_client_id_policy() {
        let mut config = MqttConfig::new("connect_test 1234567890abcdef", "localhost", 1883, 60);
        assert!(config.validate().is_ok());

        config.client_id_policy = ClientIdPolicy::Strict;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidClientId(ValidationError::ClientIdTooLong { .. }))
        ));
    }

    #[test]
    fn test_empty_client_id_requires_clean_session() {
        let mut config = MqttConfig::new("", "localhost", 1883, 60);
        assert!(config.validate().is_ok());
        assert!(config.effective_client_id().starts_with("mqtt-session/"));

        config.clean_session = false;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_generated_client_id_respects_strict_policy() {
        let mut config = MqttConfig::new("", "localhost", 1883, 60);
        config.client_id_policy = ClientIdPolicy::Strict;
        assert!(config.validate().is_ok());

        let id = config.effective_client_id();
        assert_eq!(id.len(), MQTT_V31_CLIENT_ID_MAX);
        assert!(validate_client_id(&id, Some(MQTT_V31_CLIENT_ID_MAX)).is_ok());
        assert_ne!(id, config.effective_client_id());
    }

    #[test]
    fn test_will_topic_with_wildcard_rejected() {
        let mut config = MqttConfig::new("c", "localhost", 1883, 60);
        config.will = Some(LastWill::new("status/#", "gone", Qos::AtMostOnce, false));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTopic(_))));
    }

    #[test]
    fn test_client_cert_without_server_cert() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("client.crt");
        let key = dir.path().join("client.key");
        File::create(&cert).unwrap();
        File::create(&key).unwrap();

        let mut config = MqttConfig::new("c", "localhost", 8883, 60);
        config.client_cert = Some(ClientCert {
            cert_file: cert,
            key_file: key,
            key_passphrase: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_client_cert_without_key() {
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.crt");
        let cert = dir.path().join("client.crt");
        File::create(&ca).unwrap();
        File::create(&cert).unwrap();

        let mut config = MqttConfig::new("c", "localhost", 8883, 60);
        config.server_cert = Some(ServerCert {
            ca_file: Some(ca),
            ca_path: None,
        });
        config.client_cert = Some(ClientCert {
            cert_file: cert,
            key_file: PathBuf::new(),
            key_passphrase: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_certificate_file() {
        let mut config = MqttConfig::new("c", "localhost", 8883, 60);
        config.server_cert = Some(ServerCert {
            ca_file: Some(PathBuf::from("/definitely/not/here/ca.crt")),
            ca_path: None,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CertificateNotFound(_))
        ));
    }

    #[test]
    fn test_server_cert_needs_a_source() {
        let mut config = MqttConfig::new("c", "localhost", 8883, 60);
        config.server_cert = Some(ServerCert::default());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_psk_with_certificates_is_contradictory() {
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.crt");
        File::create(&ca).unwrap();

        let mut config = MqttConfig::new("c", "localhost", 8883, 60);
        config.server_cert = Some(ServerCert {
            ca_file: Some(ca),
            ca_path: None,
        });
        config.psk = Some(Psk {
            key: "deadbeef".to_string(),
            identity: "me".to_string(),
            ciphers: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_psk_key_must_be_hex() {
        let mut config = MqttConfig::new("c", "localhost", 8883, 60);
        config.psk = Some(Psk {
            key: "not-hex".to_string(),
            identity: "me".to_string(),
            ciphers: None,
        });
        assert!(config.validate().is_err());

        config.psk = Some(Psk {
            key: "0a1B".to_string(),
            identity: "me".to_string(),
            ciphers: None,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_password_env_resolution() {
        std::env::set_var("MQTT_SESSION_TEST_PASSWORD", "from-env");
        let mut config = MqttConfig::new("c", "localhost", 1883, 60);
        config.credentials = Some(Credentials {
            username: "bob".to_string(),
            password: None,
            password_env: Some("MQTT_SESSION_TEST_PASSWORD".to_string()),
        });
        config.resolve_env_vars().unwrap();
        assert_eq!(
            config.credentials.unwrap().password.as_deref(),
            Some("from-env")
        );
    }

    #[test]
    fn test_missing_password_env() {
        let mut config = MqttConfig::new("c", "localhost", 1883, 60);
        config.credentials = Some(Credentials {
            username: "bob".to_string(),
            password: None,
            password_env: Some("MQTT_SESSION_TEST_UNSET_VARIABLE".to_string()),
        });
        assert!(matches!(
            config.resolve_env_vars(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
