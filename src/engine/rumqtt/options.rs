//! Staged engine settings and their translation into `rumqttc` options

use crate::config::{ClientCert, LastWill, ServerCert};
use crate::protocol::codes::{EngineStatus, Qos};
use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Packet size limit in both directions
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Client identity, set once during staging
#[derive(Debug, Clone)]
pub struct Identity {
    pub client_id: String,
    pub clean_session: bool,
}

/// Broker endpoint remembered for reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u16,
}

/// Certificates loaded into memory
#[derive(Debug, Clone)]
pub struct TlsBundle {
    pub ca: Vec<u8>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

/// Transport security chosen during staging
#[derive(Debug, Clone, Default)]
pub enum Security {
    #[default]
    Plain,
    /// TLS against the platform trust store
    SystemRoots,
    Bundle(TlsBundle),
}

/// Everything staged into the engine before connect
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub identity: Option<Identity>,
    pub will: Option<LastWill>,
    pub credentials: Option<(String, String)>,
    pub inflight: Option<u16>,
    pub security: Security,
}

pub fn to_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// In-flight window for a configured maximum; 0 means unlimited
pub fn inflight_window(max_inflight_messages: u32) -> u16 {
    match u16::try_from(max_inflight_messages) {
        Ok(0) | Err(_) => u16::MAX,
        Ok(window) => window,
    }
}

/// Build `rumqttc` options for one connection attempt.
///
/// Fails with `Inval` when no usable identity was staged or the host is
/// empty, both of which `rumqttc` would panic on.
pub fn build_mqtt_options(
    settings: &EngineSettings,
    endpoint: &Endpoint,
) -> Result<MqttOptions, EngineStatus> {
    let identity = settings.identity.as_ref().ok_or(EngineStatus::Inval)?;
    if identity.client_id.is_empty() || identity.client_id.starts_with(' ') {
        return Err(EngineStatus::Inval);
    }
    if endpoint.host.is_empty() {
        return Err(EngineStatus::Inval);
    }

    let mut options = MqttOptions::new(
        identity.client_id.clone(),
        endpoint.host.clone(),
        endpoint.port,
    );
    options.set_clean_session(identity.clean_session);
    // zero disables keep-alive
    options.set_keep_alive(Duration::from_secs(u64::from(endpoint.keep_alive_secs)));
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some((username, password)) = &settings.credentials {
        options.set_credentials(username.clone(), password.clone());
    }
    if let Some(window) = settings.inflight {
        options.set_inflight(window);
    }
    if let Some(will) = &settings.will {
        options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            to_qos(will.qos),
            will.retain,
        ));
    }

    match &settings.security {
        Security::Plain => {}
        Security::SystemRoots => {
            options.set_transport(Transport::tls_with_default_config());
        }
        Security::Bundle(bundle) => {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: bundle.ca.clone(),
                alpn: None,
                client_auth: bundle.client_auth.clone(),
            }));
        }
    }
    Ok(options)
}

/// Load CA material and the optional client certificate
pub fn load_bundle(
    server: &ServerCert,
    client: Option<&ClientCert>,
) -> Result<TlsBundle, EngineStatus> {
    let mut ca = Vec::new();
    if let Some(file) = &server.ca_file {
        ca.extend(load_file(file)?);
    }
    if let Some(dir) = &server.ca_path {
        ca.extend(load_ca_dir(dir)?);
    }
    if ca.is_empty() {
        return Err(EngineStatus::Inval);
    }

    let client_auth = match client {
        Some(cert) => {
            if cert.key_passphrase.is_some() {
                // rustls cannot decrypt protected keys
                return Err(EngineStatus::NotSupported);
            }
            Some((load_file(&cert.cert_file)?, load_file(&cert.key_file)?))
        }
        None => None,
    };
    Ok(TlsBundle { ca, client_auth })
}

fn load_file(path: &Path) -> Result<Vec<u8>, EngineStatus> {
    std::fs::read(path).map_err(|e| {
        debug!(path = %path.display(), "Failed to read certificate: {}", e);
        EngineStatus::Inval
    })
}

/// Concatenate every PEM file in `dir`, in name order
fn load_ca_dir(dir: &Path) -> Result<Vec<u8>, EngineStatus> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        debug!(path = %dir.display(), "Failed to read CA directory: {}", e);
        EngineStatus::Inval
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("pem" | "crt")
                )
        })
        .collect();
    paths.sort();

    let mut ca = Vec::new();
    for path in paths {
        let mut pem = load_file(&path)?;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        ca.extend(pem);
    }
    Ok(ca)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "broker.local".to_string(),
            port: 1884,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_build_plain_options() {
        let settings = EngineSettings {
            identity: Some(Identity {
                client_id: "opts".to_string(),
                clean_session: false,
            }),
            credentials: Some(("user".to_string(), "pw".to_string())),
            inflight: Some(7),
            ..Default::default()
        };
        let options = build_mqtt_options(&settings, &endpoint()).unwrap();

        assert_eq!(options.client_id(), "opts");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
        assert_eq!(options.inflight(), 7);
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn test_will_is_forwarded() {
        let settings = EngineSettings {
            identity: Some(Identity {
                client_id: "will".to_string(),
                clean_session: true,
            }),
            will: Some(LastWill::new("status", "offline", Qos::AtLeastOnce, true)),
            ..Default::default()
        };
        let options = build_mqtt_options(&settings, &endpoint()).unwrap();
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "status");
        assert_eq!(&will.message[..], b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_options_need_identity_and_host() {
        let missing = EngineSettings::default();
        assert_eq!(
            build_mqtt_options(&missing, &endpoint()).unwrap_err(),
            EngineStatus::Inval
        );

        let settings = EngineSettings {
            identity: Some(Identity {
                client_id: "ok".to_string(),
                clean_session: true,
            }),
            ..Default::default()
        };
        let no_host = Endpoint {
            host: String::new(),
            ..endpoint()
        };
        assert_eq!(
            build_mqtt_options(&settings, &no_host).unwrap_err(),
            EngineStatus::Inval
        );
    }

    #[test]
    fn test_inflight_window() {
        assert_eq!(inflight_window(0), u16::MAX);
        assert_eq!(inflight_window(20), 20);
        assert_eq!(inflight_window(100_000), u16::MAX);
    }

    #[test]
    fn test_load_bundle_from_directory() {
        let dir = TempDir::new().unwrap();
        let mut a = std::fs::File::create(dir.path().join("a.pem")).unwrap();
        write!(a, "AAA").unwrap();
        let mut b = std::fs::File::create(dir.path().join("b.crt")).unwrap();
        writeln!(b, "BBB").unwrap();
        std::fs::File::create(dir.path().join("notes.txt")).unwrap();

        let server = ServerCert {
            ca_file: None,
            ca_path: Some(dir.path().to_path_buf()),
        };
        let bundle = load_bundle(&server, None).unwrap();
        assert_eq!(bundle.ca, b"AAA\nBBB\n".to_vec());
        assert!(bundle.client_auth.is_none());
    }

    #[test]
    fn test_load_bundle_with_client_cert() {
        let dir = TempDir::new().unwrap();
        for name in ["ca.crt", "client.crt", "client.key"] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            write!(file, "{name}").unwrap();
        }
        let server = ServerCert {
            ca_file: Some(dir.path().join("ca.crt")),
            ca_path: None,
        };
        let client = ClientCert {
            cert_file: dir.path().join("client.crt"),
            key_file: dir.path().join("client.key"),
            key_passphrase: None,
        };

        let bundle = load_bundle(&server, Some(&client)).unwrap();
        assert_eq!(
            bundle.client_auth,
            Some((b"client.crt".to_vec(), b"client.key".to_vec()))
        );

        let protected = ClientCert {
            key_passphrase: Some("secret".to_string()),
            ..client
        };
        assert_eq!(
            load_bundle(&server, Some(&protected)).unwrap_err(),
            EngineStatus::NotSupported
        );
    }

    #[test]
    fn test_missing_ca_file() {
        let server = ServerCert {
            ca_file: Some("/definitely/not/here.pem".into()),
            ca_path: None,
        };
        assert_eq!(load_bundle(&server, None).unwrap_err(), EngineStatus::Inval);
    }
}
