//! WebSocket transport for the realtime backend.
//!
//! Implements the request-response pattern with UUID correlation and
//! routes pushed change events to their channel callbacks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use orderwire_protocol::MessageType;
use orderwire_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT};
use orderwire_protocol::envelope::Message;
use orderwire_protocol::messages::SubscribeRequest;

use crate::error::TransportError;
use crate::pumps::write::Outbound;
use crate::transport::{ChannelEventFn, Connection, DisconnectFn, Transport};

/// Transport factory holding the backend endpoint.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Transport for WsTransport {
    type Conn = WsConnection;

    fn connect(&self) -> impl Future<Output = Result<WsConnection, TransportError>> + Send {
        WsConnection::connect(&self.url)
    }
}

/// Handle for one multiplexed channel on a [`WsConnection`].
#[derive(Debug, Clone)]
pub struct WsChannel {
    name: String,
}

impl WsChannel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One WebSocket connection generation.
pub struct WsConnection {
    write_tx: mpsc::Sender<Outbound>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    routes: Arc<Mutex<HashMap<String, ChannelEventFn>>>,
    on_disconnect: Arc<Mutex<Option<DisconnectFn>>>,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl WsConnection {
    /// Connects to the backend WebSocket and starts the pumps.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<Outbound>(256);
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let routes: Arc<Mutex<HashMap<String, ChannelEventFn>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let on_disconnect: Arc<Mutex<Option<DisconnectFn>>> = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let pending = pending.clone();
            let routes = routes.clone();
            let on_disconnect = on_disconnect.clone();
            let cancel = cancel.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read,
                pending,
                routes,
                on_disconnect,
                write_tx,
                cancel,
            ))
        };

        Ok(Self {
            write_tx,
            pending,
            routes,
            on_disconnect,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
        })
    }

    /// Sends a request and waits for the correlated response.
    async fn request<P: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&P>,
    ) -> Result<Message, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        self.write_tx
            .send(Outbound::Envelope(msg))
            .await
            .map_err(|_| TransportError::Closed)?;

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(TransportError::Backend {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

impl Connection for WsConnection {
    type Channel = WsChannel;

    fn open_channel(
        &self,
        name: &str,
        on_event: ChannelEventFn,
    ) -> impl Future<Output = Result<WsChannel, TransportError>> + Send {
        async move {
            // Route is installed before the ack so no early event is lost.
            self.routes
                .lock()
                .await
                .insert(name.to_string(), on_event);

            let req = SubscribeRequest {
                channel: name.to_string(),
            };
            match self.request(MessageType::Subscribe, Some(&req)).await {
                Ok(_ack) => Ok(WsChannel {
                    name: name.to_string(),
                }),
                Err(e) => {
                    self.routes.lock().await.remove(name);
                    Err(e)
                }
            }
        }
    }

    fn close_channel(&self, channel: &WsChannel) -> impl Future<Output = ()> + Send {
        async move {
            self.routes.lock().await.remove(&channel.name);
            let req = SubscribeRequest {
                channel: channel.name.clone(),
            };
            // Best effort — the backend drops the channel on close anyway.
            let _ = self.request(MessageType::Unsubscribe, Some(&req)).await;
        }
    }

    fn ping(&self) -> impl Future<Output = Result<Duration, TransportError>> + Send {
        async move {
            let started = Instant::now();
            self.request::<()>(MessageType::Ping, None).await?;
            Ok(started.elapsed())
        }
    }

    fn set_disconnect_callback(&self, cb: DisconnectFn) -> impl Future<Output = ()> + Send {
        async move {
            *self.on_disconnect.lock().await = Some(cb);
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            // The write pump sends the close frame on its way out.
            self.cancel.cancel();
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}
