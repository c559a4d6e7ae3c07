//! Session management
//!
//! The controller ([`MqttClient`]) composes configuration staging, the serial
//! command queue, the event adapter and the process-wide registry that routes
//! engine events back to their session.

pub mod adapter;
pub mod client;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod staging;
pub mod state;

pub use adapter::Callbacks;
pub use client::{Completion, MqttClient, MqttClientBuilder};
pub use reconnect::{ReconnectPolicy, ReconnectionDecision};
pub use registry::{lib_cleanup, lib_init, EventSink, SessionKey};
pub use state::ConnectionState;
