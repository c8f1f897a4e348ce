//! Protocol constants shared by client and backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Message types carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Open a named logical channel.
    Subscribe,
    /// Close a named logical channel.
    Unsubscribe,
    /// Backend acknowledgement for subscribe/unsubscribe.
    Ack,
    /// Latency probe.
    Ping,
    /// Probe response.
    Pong,
    /// Row-level change pushed on a channel.
    Change,
    /// Backend-reported error.
    Error,
}

/// Timeout for a request/response round trip.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted message size. Larger frames are dropped.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default ceiling on concurrently active subscriptions per client.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 10;

/// Default heartbeat probe cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serializes_camel_case() {
        let json = serde_json::to_string(&MessageType::Subscribe).unwrap();
        assert_eq!(json, "\"subscribe\"");
        let json = serde_json::to_string(&MessageType::Change).unwrap();
        assert_eq!(json, "\"change\"");
    }

    #[test]
    fn message_type_round_trips() {
        for mt in [
            MessageType::Subscribe,
            MessageType::Unsubscribe,
            MessageType::Ack,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Change,
            MessageType::Error,
        ] {
            let json = serde_json::to_string(&mt).unwrap();
            let back: MessageType = serde_json::from_str(&json).unwrap();
            assert_eq!(mt, back);
        }
    }
}
