//! Realtime manager — the public facade.
//!
//! Multiplexes named logical subscriptions over one shared connection,
//! enforces the subscription ceiling, measures link health via heartbeats,
//! and notifies listeners of state/quality/error transitions. One manager
//! instance owns one connection; construct one per backend endpoint and
//! share it, rather than relying on globals.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, TransportError};
use crate::events::{EventDispatcher, ListenerHandle};
use crate::heartbeat::HealthState;
use crate::reconnection::{
    ManagerContext, cancel_any_reconnect, current_state, install_connection,
    replay_subscriptions, set_state, spawn_reconnect, stop_heartbeat,
};
use crate::registry::{Channel, Registered, SubscriptionRegistry};
use crate::transport::{Connection, Transport};
use crate::types::{
    ConnectionState, ErrorEvent, ManagerConfig, QualityLevel, RealtimeStats, ReconnectConfig,
};

/// Realtime connection manager.
///
/// The underlying connection is established lazily on the first
/// [`subscribe`](Self::subscribe) and kept warm after the last
/// [`unsubscribe`](Self::unsubscribe); only [`shutdown`](Self::shutdown)
/// tears it down.
pub struct RealtimeManager<T: Transport> {
    ctx: ManagerContext<T>,
    /// Serializes lazy connection establishment.
    connect_gate: Mutex<()>,
}

impl<T: Transport> RealtimeManager<T> {
    /// Creates a manager. Fails fast on invalid configuration; this is
    /// the only error the constructor can produce.
    pub fn new(transport: T, config: ManagerConfig) -> Result<Self, ConfigError> {
        Self::with_reconnect(transport, config, ReconnectConfig::default())
    }

    /// Creates a manager with a custom reconnection policy.
    pub fn with_reconnect(
        transport: T,
        config: ManagerConfig,
        reconnect: ReconnectConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ctx = ManagerContext {
            transport: Arc::new(transport),
            conn: Arc::new(Mutex::new(None)),
            registry: Arc::new(SubscriptionRegistry::new(config.max_subscriptions)),
            dispatcher: Arc::new(EventDispatcher::new()),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            health: Arc::new(StdMutex::new(HealthState::new())),
            heartbeat: Arc::new(StdMutex::new(None)),
            reconnect_cancel: Arc::new(StdMutex::new(None)),
            reconnect_seq: Arc::new(AtomicU64::new(1)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
            connect_pending: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            reconnect,
        };
        Ok(Self {
            ctx,
            connect_gate: Mutex::new(()),
        })
    }

    /// Subscribes to a named stream of change events.
    ///
    /// Returns `None` exactly when the active-subscription ceiling is
    /// reached; otherwise a usable handle, new or pre-existing (calling
    /// twice for the same name returns the same logical channel without
    /// consuming a second slot). The network-level channel is attached in
    /// the background; a backend rejection is reported through
    /// [`on_error`](Self::on_error) and releases the name.
    pub async fn subscribe(&self, name: &str) -> Option<Channel> {
        if self.ctx.shutdown.load(Ordering::Relaxed) {
            warn!(channel = %name, "subscribe after shutdown ignored");
            return None;
        }
        match self.ctx.registry.register(name) {
            Ok(Registered::Existing(channel)) => Some(channel),
            Ok(Registered::New(channel)) => {
                self.ensure_connected().await;
                let ctx = self.ctx.clone();
                let name = name.to_string();
                tokio::spawn(attach_channel(ctx, name));
                Some(channel)
            }
            Err(e) => {
                warn!(channel = %name, error = %e, "subscribe refused");
                None
            }
        }
    }

    /// Removes a named subscription. Unknown names are a harmless no-op.
    ///
    /// The underlying connection intentionally stays warm even when the
    /// last subscription is removed.
    pub async fn unsubscribe(&self, name: &str) {
        match self.ctx.registry.unregister(name) {
            Some(Some(handle)) => {
                // The close is a network round trip; run it off the
                // caller's path and without holding the connection lock.
                let conn = self.ctx.conn.lock().await.clone();
                if let Some(conn) = conn {
                    tokio::spawn(async move {
                        conn.close_channel(&handle).await;
                    });
                }
                debug!(channel = %name, "unsubscribed");
            }
            Some(None) => {
                debug!(channel = %name, "unsubscribed (channel was not attached)");
            }
            None => {}
        }
    }

    /// Point-in-time statistics snapshot. Pure read, no side effects.
    pub fn stats(&self) -> RealtimeStats {
        let (quality, last_latency) = match self.ctx.health.lock() {
            Ok(health) => (health.quality, health.last_latency),
            Err(_) => (QualityLevel::Disconnected, None),
        };
        RealtimeStats {
            total_subscriptions: self.ctx.registry.total_created(),
            active_subscriptions: self.ctx.registry.active_count(),
            reconnect_attempts: self.ctx.reconnect_attempts.load(Ordering::Relaxed),
            last_heartbeat_latency: last_latency,
            quality,
            state: current_state(&self.ctx),
        }
    }

    /// Names of the currently active subscriptions, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.ctx.registry.active_names()
    }

    /// Registers a connection-state listener.
    pub fn on_state_change(
        &self,
        cb: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.ctx.dispatcher.on_state_change(cb)
    }

    /// Registers a link-quality listener. Notified only when the
    /// classification actually changes.
    pub fn on_quality_change(
        &self,
        cb: impl Fn(QualityLevel) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.ctx.dispatcher.on_quality_change(cb)
    }

    /// Registers an error listener for expected failures (channel
    /// rejections, transport hiccups).
    pub fn on_error(
        &self,
        cb: impl Fn(&ErrorEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.ctx.dispatcher.on_error(cb)
    }

    /// Tears the manager down: cancels the heartbeat and any reconnect
    /// in flight, closes the connection, and drops all listeners. No
    /// callback fires after this returns. Idempotent.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.store(true, Ordering::Relaxed);
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        stop_heartbeat(&self.ctx).await;
        if let Some(conn) = self.ctx.conn.lock().await.take() {
            conn.close().await;
        }
        self.ctx.registry.clear();
        crate::heartbeat::set_quality(
            &self.ctx.health,
            &self.ctx.dispatcher,
            QualityLevel::Disconnected,
        );
        set_state(&self.ctx, ConnectionState::Disconnected);
        self.ctx.dispatcher.clear();
        info!("realtime manager shut down");
    }

    /// Kicks off establishment of the shared connection if there is none
    /// and nobody else is already working on it. The handshake itself
    /// runs in the background; callers observe the outcome through
    /// state-change notifications, not by waiting here.
    async fn ensure_connected(&self) {
        let _gate = self.connect_gate.lock().await;
        if self.ctx.conn.lock().await.is_some() {
            return;
        }
        {
            let reconnecting = self
                .ctx
                .reconnect_cancel
                .lock()
                .map(|guard| guard.is_some())
                .unwrap_or(false);
            if reconnecting {
                return;
            }
        }
        if self.ctx.connect_pending.swap(true, Ordering::Relaxed) {
            return;
        }

        set_state(&self.ctx, ConnectionState::Connecting);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            initial_connect(&ctx).await;
            ctx.connect_pending.store(false, Ordering::Relaxed);
        });
    }
}

/// Background half of the lazy first connect: handshake, install, and
/// opening of the channels registered while disconnected.
async fn initial_connect<T: Transport>(ctx: &ManagerContext<T>) {
    match ctx.transport.connect().await {
        Ok(conn) => {
            let conn = Arc::new(conn);
            if ctx.shutdown.load(Ordering::Relaxed) {
                conn.close().await;
                return;
            }
            install_connection(ctx, conn.clone()).await;
            match replay_subscriptions(ctx, &conn).await {
                Ok(()) => {
                    set_state(ctx, ConnectionState::Connected);
                    info!("connected");
                }
                Err(e) => {
                    // The link died during channel setup.
                    warn!(error = %e, "channel setup failed after connect");
                    stop_heartbeat(ctx).await;
                    if let Some(conn) = ctx.conn.lock().await.take() {
                        conn.close().await;
                    }
                    set_state(ctx, ConnectionState::Disconnected);
                    spawn_reconnect(ctx);
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "initial connect failed");
            set_state(ctx, ConnectionState::Disconnected);
            // Hand off to the reconnection controller.
            spawn_reconnect(ctx);
        }
    }
}

/// Background attachment of the transport channel for a new
/// subscription. When the link is down the entry simply stays detached;
/// the connect or reconnect replay opens it once the connection is up.
async fn attach_channel<T: Transport>(ctx: ManagerContext<T>, name: String) {
    let conn = ctx.conn.lock().await.clone();
    let Some(conn) = conn else {
        return;
    };
    let Some(core) = ctx.registry.core_if_detached(&name) else {
        // Unsubscribed before the attachment ran, or the replay already
        // opened this name.
        return;
    };
    match conn.open_channel(&name, core.event_fn()).await {
        Ok(handle) => {
            if !ctx.registry.attach(&name, handle.clone()) {
                // Lost the race with unsubscribe; don't leak the channel.
                conn.close_channel(&handle).await;
            }
        }
        Err(TransportError::Backend { code, message }) => {
            warn!(channel = %name, code, "subscription rejected");
            ctx.registry.unregister(&name);
            ctx.dispatcher.emit_error(ErrorEvent {
                subscription: Some(name),
                message: format!("subscription rejected ({code}): {message}"),
            });
        }
        Err(e) => {
            // Transient: the entry stays registered without a handle and
            // is replayed on the next reconnect.
            warn!(channel = %name, error = %e, "channel attach failed");
            ctx.dispatcher.emit_error(ErrorEvent {
                subscription: Some(name),
                message: e.to_string(),
            });
        }
    }
}
