use serde::{Deserialize, Serialize};
use serde_json::value::{RawValue, to_raw_value};

use crate::constants::MessageType;

/// Envelope wrapping every frame on the realtime link.
///
/// Requests and their responses share an `id` for correlation; pushed
/// events carry a server-assigned one. The payload stays raw JSON until
/// the receiver picks a concrete type from `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Failure reported by the backend in place of a normal response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: payload.map(to_raw_value).transpose()?,
            error: None,
        })
    }

    /// Envelope reporting a failed request.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Decodes the payload as `T`; `Ok(None)` when there is none.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }
}
