//! Wire protocol for Orderwire realtime subscriptions.
//!
//! Defines the JSON message envelope, typed payloads, and shared
//! constants used by the client and the realtime backend.

pub mod constants;
pub mod envelope;
pub mod messages;

pub use constants::MessageType;
pub use envelope::{Message, WireError};
pub use messages::{ChangeEvent, ChangeKind, SubscribeAck, SubscribeRequest};
