//! Typed payloads carried inside the message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to open a named logical channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub channel: String,
}

/// Backend acknowledgement for a subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub channel: String,
}

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Channel the change was delivered on.
    pub channel: String,
    /// Source table of the changed row.
    pub table: String,
    pub kind: ChangeKind,
    /// The changed row as loosely-typed JSON.
    pub record: serde_json::Value,
    pub committed_at: DateTime<Utc>,
}
