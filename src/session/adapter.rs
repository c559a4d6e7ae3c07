//! Event adapter
//!
//! Turns [`RawEvent`]s into the typed model, updates the shared connection
//! state and invokes whichever application callbacks were registered.
//! Malformed inbound data is dropped here and never reaches a callback.

use super::state::{ConnectionState, SessionState};
use crate::engine::{RawEvent, RawMessage};
use crate::protocol::codes::{ConnectReturnCode, DisconnectReason, MessageId, Qos};
use crate::protocol::message::MqttMessage;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub type ConnectCallback = Box<dyn Fn(ConnectReturnCode) + Send + Sync>;
pub type DisconnectCallback = Box<dyn Fn(DisconnectReason) + Send + Sync>;
pub type PublishCallback = Box<dyn Fn(MessageId) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(MqttMessage) + Send + Sync>;
/// Message id plus the granted QoS per filter, in request order. A refused
/// filter is reported as `0x80`.
pub type SubscribeCallback = Box<dyn Fn(MessageId, Vec<i32>) + Send + Sync>;
pub type UnsubscribeCallback = Box<dyn Fn(MessageId) + Send + Sync>;

/// Application callbacks; any of them may be absent
#[derive(Default)]
pub struct Callbacks {
    pub on_connect: Option<ConnectCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_publish: Option<PublishCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_subscribe: Option<SubscribeCallback>,
    pub on_unsubscribe: Option<UnsubscribeCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_publish", &self.on_publish.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_subscribe", &self.on_subscribe.is_some())
            .field("on_unsubscribe", &self.on_unsubscribe.is_some())
            .finish()
    }
}

/// Everything the event path of one session needs
#[derive(Debug)]
pub struct SessionContext {
    client_id: String,
    shared: Arc<SessionState>,
    callbacks: Callbacks,
    auto_reconnect: bool,
}

impl SessionContext {
    pub fn new(client_id: String, shared: Arc<SessionState>, callbacks: Callbacks) -> Self {
        Self {
            client_id,
            shared,
            callbacks,
            auto_reconnect: true,
        }
    }

    /// Whether the engine retries on its own after losing the connection
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// State to enter when the connection is lost or refused
    fn retry_state(&self) -> ConnectionState {
        if self.auto_reconnect && self.shared.is_running() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Apply one engine event
    pub fn handle(&self, event: RawEvent) {
        match event {
            RawEvent::Connect { rc } => self.on_connect(rc),
            RawEvent::Disconnect { rc } => self.on_disconnect(rc),
            RawEvent::Publish { mid } => match message_id(mid) {
                Some(mid) => {
                    if let Some(callback) = &self.callbacks.on_publish {
                        callback(mid);
                    }
                }
                None => debug!(
                    client_id = %self.client_id,
                    mid,
                    "Dropping publish ack with invalid message id"
                ),
            },
            RawEvent::Message(raw) => match translate_message(raw) {
                Some(message) => {
                    if let Some(callback) = &self.callbacks.on_message {
                        callback(message);
                    }
                }
                None => debug!(client_id = %self.client_id, "Dropping malformed inbound message"),
            },
            RawEvent::Subscribe {
                mid,
                qos_count,
                granted_qos,
            } => match message_id(mid) {
                Some(mid) => {
                    if let Some(callback) = &self.callbacks.on_subscribe {
                        callback(mid, granted_list(qos_count, &granted_qos));
                    }
                }
                None => debug!(
                    client_id = %self.client_id,
                    mid,
                    "Dropping subscribe ack with invalid message id"
                ),
            },
            RawEvent::Unsubscribe { mid } => match message_id(mid) {
                Some(mid) => {
                    if let Some(callback) = &self.callbacks.on_unsubscribe {
                        callback(mid);
                    }
                }
                None => debug!(
                    client_id = %self.client_id,
                    mid,
                    "Dropping unsubscribe ack with invalid message id"
                ),
            },
        }
    }

    fn on_connect(&self, rc: i32) {
        let code = ConnectReturnCode::from_code(rc);
        if code.is_success() {
            self.shared.set_state(ConnectionState::Connected);
        } else {
            self.shared.set_state(self.retry_state());
        }
        tracing::info!(client_id = %self.client_id, %code, "Connect acknowledged");
        if let Some(callback) = &self.callbacks.on_connect {
            callback(code);
        }
    }

    fn on_disconnect(&self, rc: i32) {
        let reason = DisconnectReason::from_code(rc);
        self.shared.set_state(self.retry_state());
        tracing::info!(client_id = %self.client_id, %reason, "Disconnected");
        if let Some(callback) = &self.callbacks.on_disconnect {
            callback(reason);
        }
    }
}

fn message_id(mid: i32) -> Option<MessageId> {
    MessageId::try_from(mid).ok()
}

/// Build a typed message, `None` when any required part is unusable
pub fn translate_message(raw: RawMessage) -> Option<MqttMessage> {
    let topic = String::from_utf8(raw.topic?).ok()?;
    if topic.is_empty() {
        return None;
    }
    Some(MqttMessage {
        message_id: message_id(raw.mid)?,
        topic,
        payload: raw.payload.unwrap_or_else(Bytes::new),
        qos: Qos::from_i32(raw.qos)?,
        retain: raw.retain,
    })
}

/// First `count` granted values, clamped to what the engine provided
pub fn granted_list(count: usize, granted: &[i32]) -> Vec<i32> {
    granted.iter().take(count).copied().collect()
}
