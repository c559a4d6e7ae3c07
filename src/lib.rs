//! MQTT client session manager
//!
//! One [`MqttClient`] per broker session. The client validates and stages its
//! configuration into a [`ProtocolEngine`], serializes every command on a
//! per-session worker task and reports each outcome exactly once through a
//! [`Completion`]. Broker events (connect, disconnect, message, acks) are
//! routed back through a process-wide registry to typed callbacks.
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_session::{MqttClient, MqttConfig, Qos};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttConfig::new("sensor-17", "localhost", 1883, 60);
//! let client = MqttClient::builder(config)
//!     .on_message(|message| println!("{}: {}", message.topic, message.payload_text()))
//!     .build(mqtt_session::RumqttEngine::new())?;
//!
//! client.connect_configured().await?;
//! client.subscribe("sensors/#", Qos::AtLeastOnce).await?;
//! client.publish_str("21.5", "sensors/t1", Qos::AtLeastOnce, false).await?;
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;

pub use config::*;
pub use engine::{ProtocolEngine, RawEvent, RawMessage, RumqttEngine};
pub use error::{SessionError, SessionResult};
pub use protocol::*;
pub use session::{
    lib_cleanup, lib_init, Callbacks, Completion, ConnectionState, MqttClient, MqttClientBuilder,
    ReconnectPolicy,
};
