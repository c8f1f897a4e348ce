//! Outbound half of the WebSocket connection.
//!
//! The pump owns serialization: callers queue protocol envelopes (or a
//! pong answering a transport ping) and never touch raw frames. A close
//! frame goes out when the pump winds down.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use orderwire_protocol::envelope::Message;

/// Item queued for the write pump.
pub(crate) enum Outbound {
    /// Protocol envelope, serialized to a text frame on the way out.
    Envelope(Message),
    /// Pong answering a transport-level ping, payload echoed back.
    Pong(tungstenite::Bytes),
}

pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            item = outbound_rx.recv() => match item {
                Some(Outbound::Envelope(msg)) => match serde_json::to_string(&msg) {
                    Ok(json) => tungstenite::Message::Text(json.into()),
                    Err(e) => {
                        warn!(id = %msg.id, "failed to serialize envelope: {e}");
                        continue;
                    }
                },
                Some(Outbound::Pong(data)) => tungstenite::Message::Pong(data),
                None => break,
            },
        };
        if let Err(e) = write.send(frame).await {
            error!("WebSocket write error: {e}");
            break;
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
