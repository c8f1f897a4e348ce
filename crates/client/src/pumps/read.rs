//! WebSocket read pump — dispatches incoming messages.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use orderwire_protocol::constants::WS_MAX_MESSAGE_SIZE;
use orderwire_protocol::envelope::Message;
use orderwire_protocol::messages::ChangeEvent;
use orderwire_protocol::MessageType;

use crate::pumps::write::Outbound;
use crate::transport::{ChannelEventFn, DisconnectFn};

/// Reads messages from the WebSocket and dispatches them.
///
/// Responses are routed to pending requests by id; `change` pushes are
/// routed to the channel named in their payload. When the stream ends or
/// errors, the disconnect callback fires — unless the pump was cancelled
/// by an explicit close.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    routes: Arc<Mutex<HashMap<String, ChannelEventFn>>>,
    on_disconnect: Arc<Mutex<Option<DisconnectFn>>>,
    write_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => match msg {
                        tungstenite::Message::Text(text) => {
                            handle_text_message(&text, &pending, &routes).await;
                        }
                        tungstenite::Message::Ping(data) => {
                            trace!("received ping, sending pong");
                            let _ = write_tx.send(Outbound::Pong(data)).await;
                        }
                        tungstenite::Message::Pong(_) => {
                            trace!("received pong");
                        }
                        tungstenite::Message::Close(_) => {
                            debug!("received close frame");
                            break;
                        }
                        _ => {} // Binary — not part of the protocol
                    },
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // An explicit close cancels the pump first; only an unexpected end
    // reports a disconnect.
    if !cancel.is_cancelled()
        && let Some(cb) = on_disconnect.lock().await.as_ref()
    {
        cb();
    }
}

/// Handles a text message from the WebSocket.
async fn handle_text_message(
    text: &str,
    pending: &Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    routes: &Arc<Mutex<HashMap<String, ChannelEventFn>>>,
) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    // Route response to pending request.
    let mut map = pending.lock().await;
    if let Some(tx) = map.remove(&msg.id) {
        let _ = tx.send(msg);
        return;
    }
    drop(map);

    // Push event — route by channel name.
    if msg.msg_type != MessageType::Change {
        warn!(msg_type = ?msg.msg_type, id = %msg.id, "unexpected push message, dropping");
        return;
    }
    let event: ChangeEvent = match msg.parse_payload() {
        Ok(Some(ev)) => ev,
        Ok(None) => {
            warn!(id = %msg.id, "change message without payload");
            return;
        }
        Err(e) => {
            warn!(id = %msg.id, "failed to parse change payload: {e}");
            return;
        }
    };

    let route = routes.lock().await.get(&event.channel).cloned();
    match route {
        Some(cb) => cb(event),
        None => {
            warn!(channel = %event.channel, "change for unknown channel, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures_util::stream;
    use orderwire_protocol::messages::ChangeKind;

    fn change_json(channel: &str) -> String {
        let event = ChangeEvent {
            channel: channel.into(),
            table: "orders".into(),
            kind: ChangeKind::Insert,
            record: serde_json::json!({"id": 7}),
            committed_at: Utc::now(),
        };
        let msg = Message::new("push-1", MessageType::Change, Some(&event)).unwrap();
        serde_json::to_string(&msg).unwrap()
    }

    #[tokio::test]
    async fn handle_text_routes_response_to_pending() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let msg = Message::new::<()>("req-1", MessageType::Pong, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();

        handle_text_message(&json, &pending, &routes).await;

        let resp = rx.await.unwrap();
        assert_eq!(resp.id, "req-1");
        assert_eq!(resp.msg_type, MessageType::Pong);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn handle_text_routes_change_to_channel() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let r = received.clone();
        let cb: ChannelEventFn = Arc::new(move |ev: ChangeEvent| {
            r.lock().unwrap().push(ev.channel);
        });
        routes.lock().await.insert("orders:driver-7".to_string(), cb);

        handle_text_message(&change_json("orders:driver-7"), &pending, &routes).await;
        // Unknown channel — dropped silently.
        handle_text_message(&change_json("orders:other"), &pending, &routes).await;

        assert_eq!(*received.lock().unwrap(), vec!["orders:driver-7"]);
    }

    #[tokio::test]
    async fn handle_text_ignores_malformed_json() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));
        handle_text_message("not valid json {{{", &pending, &routes).await;
    }

    #[tokio::test]
    async fn handle_text_rejects_oversized_message() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));

        let huge = "x".repeat(WS_MAX_MESSAGE_SIZE + 1);
        handle_text_message(&huge, &pending, &routes).await;
    }

    #[tokio::test]
    async fn read_pump_fires_disconnect_on_stream_end() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let disconnected = Arc::new(std::sync::Mutex::new(false));
        let dc = disconnected.clone();
        let on_disconnect: Arc<Mutex<Option<DisconnectFn>>> =
            Arc::new(Mutex::new(Some(Box::new(move || {
                *dc.lock().unwrap() = true;
            }))));

        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(empty, pending, routes, on_disconnect, write_tx, cancel).await;

        assert!(*disconnected.lock().unwrap());
    }

    #[tokio::test]
    async fn read_pump_suppresses_disconnect_when_cancelled() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let disconnected = Arc::new(std::sync::Mutex::new(false));
        let dc = disconnected.clone();
        let on_disconnect: Arc<Mutex<Option<DisconnectFn>>> =
            Arc::new(Mutex::new(Some(Box::new(move || {
                *dc.lock().unwrap() = true;
            }))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let pending_stream = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(
            pending_stream,
            pending,
            routes,
            on_disconnect,
            write_tx,
            cancel,
        )
        .await;

        assert!(!*disconnected.lock().unwrap());
    }

    #[tokio::test]
    async fn read_pump_answers_ping_with_pong() {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let on_disconnect: Arc<Mutex<Option<DisconnectFn>>> = Arc::new(Mutex::new(None));

        let cancel = CancellationToken::new();
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![1, 2].into()))]);

        read_pump(frames, pending, routes, on_disconnect, write_tx, cancel).await;

        let pong = write_rx.recv().await.unwrap();
        assert!(matches!(pong, Outbound::Pong(d) if d.as_ref() == [1, 2]));
    }
}
