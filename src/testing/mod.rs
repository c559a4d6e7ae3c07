//! Testing utilities
//!
//! An in-memory [`ProtocolEngine`](crate::engine::ProtocolEngine) for driving
//! sessions without a broker.

pub mod mocks;

pub use mocks::*;
