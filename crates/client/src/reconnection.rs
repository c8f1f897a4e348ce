//! Reconnection controller — backoff retries and subscription replay.
//!
//! Contains the shared [`ManagerContext`], cancellation helpers, the
//! disconnect entry point, and the reconnect loop. Retries continue
//! indefinitely with capped, jittered exponential backoff; the manager
//! has no notion of permanent failure distinct from "currently
//! unreachable".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::events::EventDispatcher;
use crate::heartbeat::{HealthState, HeartbeatMonitor, set_quality};
use crate::registry::SubscriptionRegistry;
use crate::transport::{ChannelOf, Connection, Transport};
use crate::types::{ConnectionState, ErrorEvent, ManagerConfig, QualityLevel, ReconnectConfig};

/// Shared state passed to free functions for connection setup and
/// reconnection. Avoids threading a dozen separate Arc parameters.
pub(crate) struct ManagerContext<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) conn: Arc<Mutex<Option<Arc<T::Conn>>>>,
    pub(crate) registry: Arc<SubscriptionRegistry<ChannelOf<T>>>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) state: Arc<RwLock<ConnectionState>>,
    pub(crate) health: Arc<StdMutex<HealthState>>,
    pub(crate) heartbeat: Arc<StdMutex<Option<HeartbeatMonitor>>>,
    /// Cancel token for the active reconnect loop, keyed by a sequence
    /// number so a finished loop only clears its own token.
    pub(crate) reconnect_cancel: Arc<StdMutex<Option<(u64, CancellationToken)>>>,
    pub(crate) reconnect_seq: Arc<AtomicU64>,
    pub(crate) reconnect_attempts: Arc<AtomicU64>,
    /// Set while a lazy initial connect is in flight, so concurrent
    /// subscribes do not spawn a second one.
    pub(crate) connect_pending: Arc<AtomicBool>,
    /// Set once by `shutdown()`; suppresses reconnects and callbacks.
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) config: ManagerConfig,
    pub(crate) reconnect: ReconnectConfig,
}

impl<T: Transport> Clone for ManagerContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            conn: self.conn.clone(),
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            state: self.state.clone(),
            health: self.health.clone(),
            heartbeat: self.heartbeat.clone(),
            reconnect_cancel: self.reconnect_cancel.clone(),
            reconnect_seq: self.reconnect_seq.clone(),
            reconnect_attempts: self.reconnect_attempts.clone(),
            connect_pending: self.connect_pending.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            reconnect: self.reconnect.clone(),
        }
    }
}

/// Updates the connection state and notifies listeners.
pub(crate) fn set_state<T: Transport>(ctx: &ManagerContext<T>, new_state: ConnectionState) {
    if let Ok(mut state) = ctx.state.write() {
        *state = new_state;
    }
    ctx.dispatcher.emit_state(new_state);
}

pub(crate) fn current_state<T: Transport>(ctx: &ManagerContext<T>) -> ConnectionState {
    ctx.state
        .read()
        .map(|s| *s)
        .unwrap_or(ConnectionState::Disconnected)
}

/// Cancels any active reconnect loop.
pub(crate) fn cancel_any_reconnect(
    reconnect_cancel: &StdMutex<Option<(u64, CancellationToken)>>,
) {
    if let Ok(mut guard) = reconnect_cancel.lock()
        && let Some((_, token)) = guard.take()
    {
        token.cancel();
    }
}

/// Installs a freshly connected generation: disconnect callback, shared
/// connection slot, and a restarted heartbeat over a cleared window.
pub(crate) async fn install_connection<T: Transport>(
    ctx: &ManagerContext<T>,
    conn: Arc<T::Conn>,
) {
    let ctx_dc = ctx.clone();
    conn.set_disconnect_callback(Box::new(move || {
        let ctx = ctx_dc.clone();
        tokio::spawn(handle_disconnect(ctx));
    }))
    .await;

    *ctx.conn.lock().await = Some(conn.clone());

    if let Ok(mut health) = ctx.health.lock() {
        health.window.clear();
        health.last_latency = None;
    }
    let monitor = HeartbeatMonitor::start(
        conn,
        ctx.config.heartbeat_interval,
        ctx.config.enable_logging,
        ctx.health.clone(),
        ctx.dispatcher.clone(),
    );
    let old = match ctx.heartbeat.lock() {
        Ok(mut slot) => slot.replace(monitor),
        Err(_) => None,
    };
    if let Some(old) = old {
        old.stop().await;
    }
}

/// Takes and fully stops the active heartbeat monitor, if any.
pub(crate) async fn stop_heartbeat<T: Transport>(ctx: &ManagerContext<T>) {
    let monitor = match ctx.heartbeat.lock() {
        Ok(mut slot) => slot.take(),
        Err(_) => None,
    };
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
}

/// Re-opens a channel for every registered name on the new connection
/// and commits the handle swap atomically. A backend rejection releases
/// that one name and surfaces an error event; transport-level failures
/// abort the replay so the reconnect loop can try again.
pub(crate) async fn replay_subscriptions<T: Transport>(
    ctx: &ManagerContext<T>,
    conn: &Arc<T::Conn>,
) -> Result<(), TransportError> {
    let targets = ctx.registry.detached_cores();
    let mut opened = Vec::with_capacity(targets.len());
    for (name, core) in targets {
        match conn.open_channel(&name, core.event_fn()).await {
            Ok(handle) => opened.push((name, handle)),
            Err(TransportError::Backend { code, message }) => {
                warn!(channel = %name, code, "subscription rejected during replay");
                ctx.registry.unregister(&name);
                ctx.dispatcher.emit_error(ErrorEvent {
                    subscription: Some(name),
                    message: format!("subscription rejected ({code}): {message}"),
                });
            }
            Err(e) => return Err(e),
        }
    }
    ctx.registry.migrate(opened);
    Ok(())
}

/// Entry point for an unexpected transport drop.
///
/// Stops the heartbeat, detaches stale channel handles, notifies the
/// quality/state transitions, and spawns the reconnect loop.
pub(crate) async fn handle_disconnect<T: Transport>(ctx: ManagerContext<T>) {
    if ctx.shutdown.load(Ordering::Relaxed) {
        return;
    }

    stop_heartbeat(&ctx).await;
    *ctx.conn.lock().await = None;
    ctx.registry.detach_all();

    set_quality(&ctx.health, &ctx.dispatcher, QualityLevel::Disconnected);
    set_state(&ctx, ConnectionState::Disconnected);
    info!("connection lost");

    spawn_reconnect(&ctx);
}

/// Creates a fresh cancellation token, stores it, and spawns the loop.
/// Does nothing once the manager is shut down.
pub(crate) fn spawn_reconnect<T: Transport>(ctx: &ManagerContext<T>) {
    if ctx.shutdown.load(Ordering::Relaxed) {
        return;
    }
    let cancel = CancellationToken::new();
    let seq = ctx.reconnect_seq.fetch_add(1, Ordering::Relaxed);
    cancel_any_reconnect(&ctx.reconnect_cancel);
    if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
        *guard = Some((seq, cancel.clone()));
    }
    tokio::spawn(reconnect_loop(ctx.clone(), seq, cancel));
}

/// Reconnection loop with capped exponential backoff. Runs until it
/// reconnects or is cancelled; the retry count is unbounded.
pub(crate) async fn reconnect_loop<T: Transport>(
    ctx: ManagerContext<T>,
    seq: u64,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            return;
        }
        attempt = attempt.saturating_add(1);
        ctx.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        let delay = ctx.reconnect.delay_for_attempt(attempt);
        let delay_secs = delay.as_secs_f64();

        set_state(&ctx, ConnectionState::Connecting);
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            "reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if cancel.is_cancelled() || ctx.shutdown.load(Ordering::Relaxed) {
            return;
        }

        match ctx.transport.connect().await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                // The manager may have shut down while the handshake ran.
                if ctx.shutdown.load(Ordering::Relaxed) {
                    conn.close().await;
                    return;
                }
                install_connection(&ctx, conn.clone()).await;
                match replay_subscriptions(&ctx, &conn).await {
                    Ok(()) => {
                        set_state(&ctx, ConnectionState::Connected);
                        info!(attempt, "reconnected");
                        break;
                    }
                    Err(e) => {
                        // The new connection died mid-replay. Tear it
                        // down and keep retrying.
                        warn!(attempt, error = %e, "replay failed, retrying");
                        stop_heartbeat(&ctx).await;
                        if let Some(conn) = ctx.conn.lock().await.take() {
                            conn.close().await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
    }

    // Clean up the cancel token if it's still ours.
    if let Ok(mut guard) = ctx.reconnect_cancel.lock()
        && guard.as_ref().is_some_and(|(id, _)| *id == seq)
    {
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::mock::{MockState, MockTransport};

    fn test_ctx() -> (ManagerContext<MockTransport>, Arc<MockState>) {
        let transport = MockTransport::new();
        let state = transport.state.clone();
        let ctx = ManagerContext {
            transport: Arc::new(transport),
            conn: Arc::new(Mutex::new(None)),
            registry: Arc::new(SubscriptionRegistry::new(4)),
            dispatcher: Arc::new(EventDispatcher::new()),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            health: Arc::new(StdMutex::new(HealthState::new())),
            heartbeat: Arc::new(StdMutex::new(None)),
            reconnect_cancel: Arc::new(StdMutex::new(None)),
            reconnect_seq: Arc::new(AtomicU64::new(1)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
            connect_pending: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            config: ManagerConfig {
                max_subscriptions: 4,
                heartbeat_interval: Duration::from_secs(1),
                enable_logging: false,
            },
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_factor: 2.0,
            },
        };
        (ctx, state)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn cancel_any_reconnect_clears_token() {
        let cell = Arc::new(StdMutex::new(None));
        let token = CancellationToken::new();
        *cell.lock().unwrap() = Some((1, token.clone()));

        cancel_any_reconnect(&cell);

        assert!(cell.lock().unwrap().is_none());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_any_reconnect_when_empty_is_noop() {
        let cell: StdMutex<Option<(u64, CancellationToken)>> = StdMutex::new(None);
        cancel_any_reconnect(&cell);
        assert!(cell.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_reconnect_after_shutdown_does_nothing() {
        let (ctx, state) = test_ctx();
        ctx.shutdown.store(true, Ordering::Relaxed);

        // A disconnect signal racing with teardown must not install a new
        // cancel token or retry behind the shut-down manager's back.
        spawn_reconnect(&ctx);
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(100)).await;
            settle().await;
        }

        assert!(ctx.reconnect_cancel.lock().unwrap().is_none());
        assert_eq!(state.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_loop_stops_when_shutdown_flag_is_set() {
        let (ctx, state) = test_ctx();
        spawn_reconnect(&ctx);
        // The loop is now sleeping out its first backoff delay.
        settle().await;

        ctx.shutdown.store(true, Ordering::Relaxed);
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(100)).await;
            settle().await;
        }

        assert_eq!(state.connect_count(), 0);
        assert_eq!(ctx.reconnect_attempts.load(Ordering::Relaxed), 1);
    }
}
