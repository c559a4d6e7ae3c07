//! Application-facing message and result types

use super::codes::{EngineStatus, MessageId, Qos};
use bytes::Bytes;
use std::fmt::Write as _;

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl MqttMessage {
    /// Payload as UTF-8, `None` if it is not valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Best-effort text rendering of the payload.
    ///
    /// UTF-8 when the bytes decode, otherwise lowercase hex. Never fails.
    pub fn payload_text(&self) -> String {
        match self.payload_str() {
            Some(text) => text.to_string(),
            None => to_hex(&self.payload),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Outcome of a queued command: the engine status plus the id it assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub status: EngineStatus,
    pub message_id: MessageId,
}

impl CommandResult {
    pub fn new(status: EngineStatus, message_id: MessageId) -> Self {
        Self { status, message_id }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &'static [u8]) -> MqttMessage {
        MqttMessage {
            message_id: 1,
            topic: "t".to_string(),
            payload: Bytes::from_static(payload),
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    #[test]
    fn test_payload_text_utf8() {
        let msg = message(b"hello");
        assert_eq!(msg.payload_str(), Some("hello"));
        assert_eq!(msg.payload_text(), "hello");
    }

    #[test]
    fn test_payload_text_multibyte_utf8() {
        let msg = message("ほげほげ".as_bytes());
        assert_eq!(msg.payload_text(), "ほげほげ");
    }

    #[test]
    fn test_payload_text_falls_back_to_hex() {
        let msg = message(&[0xff, 0x00, 0xab]);
        assert_eq!(msg.payload_str(), None);
        assert_eq!(msg.payload_text(), "ff00ab");
    }

    #[test]
    fn test_empty_payload() {
        let msg = message(b"");
        assert_eq!(msg.payload_text(), "");
    }

    #[test]
    fn test_command_result_success() {
        assert!(CommandResult::new(EngineStatus::Success, 3).is_success());
        assert!(!CommandResult::new(EngineStatus::NoConn, 0).is_success());
    }
}
