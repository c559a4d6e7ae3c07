//! Protocol-level types shared by the session and its engines
//!
//! Status codes, the message envelope and topic validation.

pub mod codes;
pub mod message;
pub mod topics;

pub use codes::*;
pub use message::*;
pub use topics::*;
