//! Protocol engine backed by `rumqttc`
//!
//! Commands are handed to `rumqttc`'s request channel without waiting for the
//! broker; acknowledgements come back later as [`RawEvent`](crate::engine::RawEvent)s
//! from a background I/O task that also applies the reconnect policy.
//!
//! Not everything the session can stage has a `rumqttc` equivalent. Those
//! options report `NotSupported` and fail session construction:
//!
//! - MQTT 3.1 (`protocol_version = "v31"`)
//! - pre-shared key TLS
//! - `insecure`, `cert_reqs = "verify_none"`, `tls_version` and `ciphers`
//! - encrypted client keys

mod engine;
pub mod event_map;
pub mod options;

pub use engine::{PacketIdTracker, RumqttEngine};
