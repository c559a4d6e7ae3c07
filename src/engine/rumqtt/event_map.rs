//! Translate `rumqttc` event loop output into [`RawEvent`]s

use crate::engine::{RawEvent, RawMessage};
use crate::protocol::codes::{EngineStatus, KEEPALIVE_TIMEOUT_CODE};
use rumqttc::{
    ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, StateError, SubscribeReasonCode,
};

/// Granted QoS value reported for a refused subscription
pub const SUBACK_FAILURE: i32 = 0x80;

pub fn connack_code(code: ConnectReturnCode) -> i32 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// Map one event loop notification; `None` for traffic the session ignores
pub fn map_event(event: &Event) -> Option<RawEvent> {
    match event {
        Event::Incoming(packet) => map_incoming(packet),
        Event::Outgoing(Outgoing::Publish(0)) => Some(RawEvent::Publish { mid: 0 }),
        Event::Outgoing(Outgoing::Disconnect) => Some(RawEvent::Disconnect { rc: 0 }),
        Event::Outgoing(_) => None,
    }
}

fn map_incoming(packet: &Packet) -> Option<RawEvent> {
    match packet {
        Packet::ConnAck(ack) => Some(RawEvent::Connect {
            rc: connack_code(ack.code),
        }),
        Packet::Publish(publish) => Some(RawEvent::Message(RawMessage {
            mid: i32::from(publish.pkid),
            topic: Some(Vec::from(&publish.topic[..])),
            payload: Some(publish.payload.clone()),
            qos: publish.qos as i32,
            retain: publish.retain,
        })),
        Packet::PubAck(ack) => Some(RawEvent::Publish {
            mid: i32::from(ack.pkid),
        }),
        Packet::PubComp(comp) => Some(RawEvent::Publish {
            mid: i32::from(comp.pkid),
        }),
        Packet::SubAck(ack) => {
            let granted_qos: Vec<i32> = ack
                .return_codes
                .iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => *qos as i32,
                    SubscribeReasonCode::Failure => SUBACK_FAILURE,
                })
                .collect();
            Some(RawEvent::Subscribe {
                mid: i32::from(ack.pkid),
                qos_count: granted_qos.len(),
                granted_qos,
            })
        }
        Packet::UnsubAck(ack) => Some(RawEvent::Unsubscribe {
            mid: i32::from(ack.pkid),
        }),
        Packet::Disconnect => Some(RawEvent::Disconnect {
            rc: EngineStatus::ConnLost.code(),
        }),
        _ => None,
    }
}

/// Event reported when the event loop fails
pub fn error_event(error: &ConnectionError) -> RawEvent {
    match error {
        ConnectionError::ConnectionRefused(code) => RawEvent::Connect {
            rc: connack_code(*code),
        },
        ConnectionError::MqttState(StateError::AwaitPingResp) => RawEvent::Disconnect {
            rc: KEEPALIVE_TIMEOUT_CODE,
        },
        _ => RawEvent::Disconnect {
            rc: EngineStatus::ConnLost.code(),
        },
    }
}
