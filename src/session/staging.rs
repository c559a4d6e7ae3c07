//! Configuration staging
//!
//! Hands a validated [`MqttConfig`] to the engine before the first connect.
//! Options are applied in a fixed order and the first rejection aborts.

use crate::config::{ConfigError, MqttConfig};
use crate::engine::ProtocolEngine;
use crate::protocol::codes::EngineStatus;
use tracing::debug;

/// Validate `config` and apply every populated option to `engine`.
///
/// Order: identity, reconnect policy, last-will, credentials, publish
/// tuning, certificate bundle, TLS options, pre-shared key.
pub fn stage<E: ProtocolEngine + ?Sized>(
    config: &MqttConfig,
    client_id: &str,
    engine: &mut E,
) -> Result<(), ConfigError> {
    config.validate()?;

    check(
        "identity",
        engine.set_identity(client_id, config.clean_session, config.protocol_version),
    )?;
    check("reconnect", engine.set_reconnect_policy(&config.reconnect))?;

    if let Some(will) = &config.will {
        check("will", engine.set_will(will))?;
    }
    if let Some(credentials) = &config.credentials {
        check("credentials", engine.set_credentials(&credentials.resolved()?))?;
    }
    if let Some(tuning) = &config.publish {
        check("publish", engine.set_publish_tuning(tuning))?;
    }
    if let Some(server) = &config.server_cert {
        check(
            "tls_bundle",
            engine.set_tls_bundle(server, config.client_cert.as_ref()),
        )?;
    }
    if let Some(options) = &config.tls {
        check("tls", engine.set_tls_options(options))?;
    }
    if let Some(psk) = &config.psk {
        check("psk", engine.set_psk(psk))?;
    }
    Ok(())
}

fn check(option: &'static str, status: EngineStatus) -> Result<(), ConfigError> {
    if status.is_success() {
        debug!(option, "Option staged");
        Ok(())
    } else {
        Err(ConfigError::Rejected { option, status })
    }
}
