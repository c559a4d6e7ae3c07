//! Protocol engine seam
//!
//! The session never speaks MQTT itself. Wire encoding, keep-alive, QoS
//! retries and the transport all live behind [`ProtocolEngine`]; the session
//! stages configuration into it, issues commands through its worker task and
//! receives [`RawEvent`]s back through an [`EventSink`].

use crate::config::{
    ClientCert, Credentials, LastWill, ProtocolVersion, Psk, PublishTuning, ServerCert, TlsOptions,
};
use crate::protocol::codes::{EngineStatus, MessageId, Qos};
use crate::session::reconnect::ReconnectPolicy;
use bytes::Bytes;

pub mod rumqtt;

pub use crate::session::registry::EventSink;
pub use rumqtt::RumqttEngine;

/// Inbound message exactly as the engine reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub mid: i32,
    /// Topic bytes, `None` when the engine could not provide them
    pub topic: Option<Vec<u8>>,
    pub payload: Option<Bytes>,
    pub qos: i32,
    pub retain: bool,
}

/// Event notifications emitted by an engine's I/O loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// Connect acknowledgement with the broker return code
    Connect { rc: i32 },
    /// Connection closed; 0 means the client asked for it
    Disconnect { rc: i32 },
    /// Outgoing publish completed its QoS flow
    Publish { mid: i32 },
    Message(RawMessage),
    /// Subscribe acknowledgement. Only the first `qos_count` entries of
    /// `granted_qos` are meaningful.
    Subscribe {
        mid: i32,
        qos_count: usize,
        granted_qos: Vec<i32>,
    },
    Unsubscribe { mid: i32 },
}

/// Operations the session needs from a protocol engine.
///
/// Setters are applied once, before the first connect, from the thread that
/// builds the session. Everything async runs on the session's worker task,
/// one call at a time, so implementations need no internal locking around
/// their own state.
#[async_trait::async_trait]
pub trait ProtocolEngine: Send + 'static {
    /// Attach the sink that receives this session's events
    fn register_events(&mut self, sink: EventSink);

    /// Identity of the session; applied before any other option
    fn set_identity(
        &mut self,
        client_id: &str,
        clean_session: bool,
        version: ProtocolVersion,
    ) -> EngineStatus;

    fn set_reconnect_policy(&mut self, policy: &ReconnectPolicy) -> EngineStatus;

    fn set_will(&mut self, will: &LastWill) -> EngineStatus;

    fn set_credentials(&mut self, credentials: &Credentials) -> EngineStatus;

    fn set_publish_tuning(&mut self, tuning: &PublishTuning) -> EngineStatus;

    /// Server trust anchors plus the optional client certificate
    fn set_tls_bundle(&mut self, server: &ServerCert, client: Option<&ClientCert>) -> EngineStatus;

    fn set_tls_options(&mut self, options: &TlsOptions) -> EngineStatus;

    fn set_psk(&mut self, psk: &Psk) -> EngineStatus;

    async fn connect(&mut self, host: &str, port: u16, keep_alive_secs: u16) -> EngineStatus;

    /// Reconnect to the last endpoint passed to `connect`
    async fn reconnect(&mut self) -> EngineStatus;

    async fn disconnect(&mut self) -> EngineStatus;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retain: bool,
    ) -> (EngineStatus, MessageId);

    /// Subscribe to one or more filters in a single request
    async fn subscribe(&mut self, filters: &[String], qos: Qos) -> (EngineStatus, MessageId);

    async fn unsubscribe(&mut self, filter: &str) -> (EngineStatus, MessageId);

    /// Start delivering events in the background
    async fn start_loop(&mut self) -> EngineStatus;

    async fn stop_loop(&mut self) -> EngineStatus;

    /// Release every resource; the engine is dropped right after
    async fn destroy(&mut self);
}
