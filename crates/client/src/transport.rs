//! Transport abstraction consumed by the manager.
//!
//! The manager is generic over [`Transport`] so tests can construct
//! isolated instances against an in-process mock while production code
//! uses the WebSocket implementation in [`crate::ws`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use orderwire_protocol::messages::ChangeEvent;

use crate::error::TransportError;

/// Callback invoked with every change event delivered on a channel.
pub type ChannelEventFn = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback invoked once when the connection drops unexpectedly.
/// Not invoked for an explicit [`Connection::close`].
pub type DisconnectFn = Box<dyn Fn() + Send + Sync>;

/// Factory for connections to a realtime backend.
///
/// Each successful [`connect`](Transport::connect) produces a fresh
/// connection generation; channel handles from earlier generations are
/// invalid once the generation they belong to is gone.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// One live connection to the backend.
pub trait Connection: Send + Sync + 'static {
    /// Opaque handle for a multiplexed logical channel.
    type Channel: Clone + Send + Sync + 'static;

    /// Opens a named channel; `on_event` receives its change events.
    fn open_channel(
        &self,
        name: &str,
        on_event: ChannelEventFn,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    /// Closes a channel. Best effort; errors are swallowed.
    fn close_channel(&self, channel: &Self::Channel) -> impl Future<Output = ()> + Send;

    /// Latency probe: round trip to the backend.
    fn ping(&self) -> impl Future<Output = Result<Duration, TransportError>> + Send;

    /// Installs the disconnect callback. At most one; later calls replace it.
    fn set_disconnect_callback(&self, cb: DisconnectFn) -> impl Future<Output = ()> + Send;

    /// Tears the connection down. The disconnect callback does not fire.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Channel handle type of a transport.
pub type ChannelOf<T> = <<T as Transport>::Conn as Connection>::Channel;

#[cfg(test)]
pub(crate) mod mock {
    //! In-process transport used by the manager, heartbeat and
    //! reconnection tests.

    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use chrono::Utc;
    use orderwire_protocol::messages::ChangeKind;

    use super::*;

    /// Scripted outcome for ping probes.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum PingBehavior {
        /// Resolve with the given latency.
        Latency(Duration),
        /// Resolve with a transport error (counts as a miss).
        Fail,
        /// Never resolve; the probe deadline turns it into a miss.
        Hang,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct MockChannel {
        pub(crate) name: String,
        pub(crate) generation: u32,
    }

    pub(crate) struct MockTransport {
        pub(crate) state: Arc<MockState>,
    }

    #[derive(Default)]
    pub(crate) struct MockState {
        connects: AtomicU32,
        /// Number of upcoming connect attempts that should fail.
        pub(crate) fail_next_connects: AtomicU32,
        /// When set, connect attempts never resolve.
        pub(crate) hang_connects: AtomicBool,
        last_conn: StdMutex<Option<Arc<MockConn>>>,
    }

    pub(crate) struct MockConn {
        pub(crate) generation: u32,
        routes: StdMutex<HashMap<String, ChannelEventFn>>,
        pub(crate) opened: StdMutex<Vec<String>>,
        pub(crate) closed_channels: StdMutex<Vec<String>>,
        /// Channel names the backend rejects with an authorization error.
        pub(crate) reject: StdMutex<Vec<String>>,
        pub(crate) ping: StdMutex<PingBehavior>,
        /// When set, channel closes never resolve.
        pub(crate) hang_close: AtomicBool,
        on_disconnect: StdMutex<Option<DisconnectFn>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self {
                state: Arc::new(MockState::default()),
            }
        }
    }

    impl MockState {
        pub(crate) fn connect_count(&self) -> u32 {
            self.connects.load(Ordering::Relaxed)
        }

        /// The most recently established connection.
        pub(crate) fn conn(&self) -> Arc<MockConn> {
            self.last_conn
                .lock()
                .unwrap()
                .clone()
                .expect("no connection established")
        }
    }

    impl MockConn {
        /// Simulates an unexpected transport drop.
        pub(crate) fn trigger_drop(&self) {
            let cb = self.on_disconnect.lock().unwrap().take();
            if let Some(cb) = cb {
                cb();
            }
        }

        /// Delivers a change event on a named channel, as the backend would.
        pub(crate) fn push_change(&self, name: &str) {
            let route = self.routes.lock().unwrap().get(name).cloned();
            if let Some(cb) = route {
                cb(ChangeEvent {
                    channel: name.to_string(),
                    table: "orders".into(),
                    kind: ChangeKind::Update,
                    record: serde_json::json!({"id": 1}),
                    committed_at: Utc::now(),
                });
            }
        }

        pub(crate) fn open_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.routes.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }

        pub(crate) fn set_ping(&self, behavior: PingBehavior) {
            *self.ping.lock().unwrap() = behavior;
        }
    }

    impl Transport for MockTransport {
        type Conn = Arc<MockConn>;

        fn connect(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send {
            let state = self.state.clone();
            async move {
                if state.hang_connects.load(Ordering::Relaxed) {
                    std::future::pending::<()>().await;
                }
                if state.fail_next_connects.load(Ordering::Relaxed) > 0 {
                    state.fail_next_connects.fetch_sub(1, Ordering::Relaxed);
                    return Err(TransportError::Closed);
                }
                let generation = state.connects.fetch_add(1, Ordering::Relaxed) + 1;
                let conn = Arc::new(MockConn {
                    generation,
                    routes: StdMutex::new(HashMap::new()),
                    opened: StdMutex::new(Vec::new()),
                    closed_channels: StdMutex::new(Vec::new()),
                    reject: StdMutex::new(Vec::new()),
                    ping: StdMutex::new(PingBehavior::Latency(Duration::from_millis(20))),
                    hang_close: AtomicBool::new(false),
                    on_disconnect: StdMutex::new(None),
                });
                *state.last_conn.lock().unwrap() = Some(conn.clone());
                Ok(conn)
            }
        }
    }

    impl Connection for Arc<MockConn> {
        type Channel = MockChannel;

        fn open_channel(
            &self,
            name: &str,
            on_event: ChannelEventFn,
        ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send {
            let conn = self.clone();
            let name = name.to_string();
            async move {
                if conn.reject.lock().unwrap().contains(&name) {
                    return Err(TransportError::Backend {
                        code: 403,
                        message: "channel not allowed".into(),
                    });
                }
                conn.routes.lock().unwrap().insert(name.clone(), on_event);
                conn.opened.lock().unwrap().push(name.clone());
                Ok(MockChannel {
                    name,
                    generation: conn.generation,
                })
            }
        }

        fn close_channel(&self, channel: &Self::Channel) -> impl Future<Output = ()> + Send {
            let conn = self.clone();
            let name = channel.name.clone();
            async move {
                if conn.hang_close.load(Ordering::Relaxed) {
                    std::future::pending::<()>().await;
                }
                conn.routes.lock().unwrap().remove(&name);
                conn.closed_channels.lock().unwrap().push(name);
            }
        }

        fn ping(&self) -> impl Future<Output = Result<Duration, TransportError>> + Send {
            let behavior = *self.ping.lock().unwrap();
            async move {
                match behavior {
                    PingBehavior::Latency(latency) => Ok(latency),
                    PingBehavior::Fail => Err(TransportError::Closed),
                    PingBehavior::Hang => {
                        std::future::pending::<()>().await;
                        unreachable!()
                    }
                }
            }
        }

        fn set_disconnect_callback(&self, cb: DisconnectFn) -> impl Future<Output = ()> + Send {
            let conn = self.clone();
            async move {
                *conn.on_disconnect.lock().unwrap() = Some(cb);
            }
        }

        fn close(&self) -> impl Future<Output = ()> + Send {
            let conn = self.clone();
            async move {
                // Explicit close: drop the callback so it can never fire.
                conn.on_disconnect.lock().unwrap().take();
                conn.routes.lock().unwrap().clear();
            }
        }
    }
}
