//! Read/write pumps for the WebSocket connection.

pub(crate) mod read;
pub(crate) mod write;
