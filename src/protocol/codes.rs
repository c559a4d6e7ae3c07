//! Status and reason codes exchanged with the protocol engine
//!
//! The engine reports everything as plain integers. These enums give those
//! integers names; every conversion is total so an unexpected code can never
//! fail a callback.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message identifier assigned by the engine. Zero for QoS 0 publishes.
pub type MessageId = u16;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Fire and forget (<= 1 delivery)
    #[default]
    AtMostOnce,
    /// Acknowledged delivery (>= 1 delivery)
    AtLeastOnce,
    /// Assured delivery (exactly 1 delivery)
    ExactlyOnce,
}

impl Qos {
    pub fn as_i32(self) -> i32 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// Parse a raw QoS level, `None` for anything outside 0..=2
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Qos::from_i32(i32::from(value)).ok_or(value)
    }
}

/// Status code returned by every engine command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    ConnPending,
    Success,
    NoMem,
    Protocol,
    Inval,
    NoConn,
    ConnRefused,
    NotFound,
    ConnLost,
    Tls,
    PayloadSize,
    NotSupported,
    Auth,
    AclDenied,
    Unknown,
    Errno,
    Eai,
}

impl EngineStatus {
    /// Map a raw engine return value; unrecognized values become `Unknown`
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => EngineStatus::ConnPending,
            0 => EngineStatus::Success,
            1 => EngineStatus::NoMem,
            2 => EngineStatus::Protocol,
            3 => EngineStatus::Inval,
            4 => EngineStatus::NoConn,
            5 => EngineStatus::ConnRefused,
            6 => EngineStatus::NotFound,
            7 => EngineStatus::ConnLost,
            8 => EngineStatus::Tls,
            9 => EngineStatus::PayloadSize,
            10 => EngineStatus::NotSupported,
            11 => EngineStatus::Auth,
            12 => EngineStatus::AclDenied,
            14 => EngineStatus::Errno,
            15 => EngineStatus::Eai,
            _ => EngineStatus::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            EngineStatus::ConnPending => -1,
            EngineStatus::Success => 0,
            EngineStatus::NoMem => 1,
            EngineStatus::Protocol => 2,
            EngineStatus::Inval => 3,
            EngineStatus::NoConn => 4,
            EngineStatus::ConnRefused => 5,
            EngineStatus::NotFound => 6,
            EngineStatus::ConnLost => 7,
            EngineStatus::Tls => 8,
            EngineStatus::PayloadSize => 9,
            EngineStatus::NotSupported => 10,
            EngineStatus::Auth => 11,
            EngineStatus::AclDenied => 12,
            EngineStatus::Unknown => 13,
            EngineStatus::Errno => 14,
            EngineStatus::Eai => 15,
        }
    }

    pub fn is_success(self) -> bool {
        self == EngineStatus::Success
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EngineStatus::ConnPending => "connection pending",
            EngineStatus::Success => "success",
            EngineStatus::NoMem => "out of memory",
            EngineStatus::Protocol => "protocol violation",
            EngineStatus::Inval => "invalid argument",
            EngineStatus::NoConn => "not connected",
            EngineStatus::ConnRefused => "connection refused",
            EngineStatus::NotFound => "not found",
            EngineStatus::ConnLost => "connection lost",
            EngineStatus::Tls => "TLS failure",
            EngineStatus::PayloadSize => "payload too large",
            EngineStatus::NotSupported => "not supported",
            EngineStatus::Auth => "authentication failure",
            EngineStatus::AclDenied => "access denied",
            EngineStatus::Unknown => "unknown error",
            EngineStatus::Errno => "system error",
            EngineStatus::Eai => "address resolution failure",
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// Broker answer to a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Success,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    BrokerUnavailable,
    /// Any other code, kept raw
    Unknown(i32),
}

impl ConnectReturnCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ConnectReturnCode::Success,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::BrokerUnavailable,
            other => ConnectReturnCode::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == ConnectReturnCode::Success
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Success => f.write_str("Success"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                f.write_str("Unacceptable_Protocol_Version")
            }
            ConnectReturnCode::IdentifierRejected => f.write_str("Identifier_Rejected"),
            ConnectReturnCode::BrokerUnavailable => f.write_str("Broker_Unavailable"),
            ConnectReturnCode::Unknown(code) => write!(f, "Unknown({code})"),
        }
    }
}

/// Raw disconnect code the engine uses for an expired keep-alive
pub const KEEPALIVE_TIMEOUT_CODE: i32 = 19;

/// Why a session went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client asked for it
    Requested,
    /// No traffic from the broker within the keep-alive window
    KeepAliveTimeout,
    /// Underlying transport failure, engine code passed through
    Transport(i32),
}

impl DisconnectReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DisconnectReason::Requested,
            KEEPALIVE_TIMEOUT_CODE => DisconnectReason::KeepAliveTimeout,
            other => DisconnectReason::Transport(other),
        }
    }

    pub fn is_requested(self) -> bool {
        self == DisconnectReason::Requested
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("Disconnect_Requested"),
            DisconnectReason::KeepAliveTimeout => f.write_str("Keepalive_Timeout"),
            DisconnectReason::Transport(code) => write!(f, "Transport({code})"),
        }
    }
}
