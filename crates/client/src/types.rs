//! Public types for the realtime connection manager.

use std::time::Duration;

use orderwire_protocol::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_SUBSCRIPTIONS};

use crate::error::ConfigError;

/// Connection state of the underlying link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// Handshake or reconnect attempt in progress.
    Connecting,
    /// Connected and serving subscriptions.
    Connected,
}

/// Discrete link-quality classification derived from recent heartbeats.
///
/// Ordered from best to worst; `Disconnected` applies unconditionally
/// whenever the connection state is not [`ConnectionState::Connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Excellent,
    Good,
    Poor,
    Disconnected,
}

/// Manager configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Ceiling on concurrently active subscriptions.
    pub max_subscriptions: usize,
    /// Heartbeat probe cadence. Also the per-probe response deadline.
    pub heartbeat_interval: Duration,
    /// Enables per-probe trace output. Lifecycle events log regardless.
    pub enable_logging: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            enable_logging: false,
        }
    }
}

impl ManagerConfig {
    /// Validates the configuration. Called at manager construction;
    /// an invalid value is a programmer error, not a runtime condition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_subscriptions == 0 {
            return Err(ConfigError::ZeroMaxSubscriptions);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        Ok(())
    }
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Jitter-free delay for a given attempt number (1-based).
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd. The result never
    /// exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt).as_secs_f64();
        let jitter = base * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (base + jitter * offset)
            .max(0.05)
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(with_jitter)
    }
}

/// Point-in-time snapshot of manager statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeStats {
    /// Subscriptions ever created over the manager's lifetime.
    pub total_subscriptions: u64,
    /// Currently active subscriptions.
    pub active_subscriptions: usize,
    /// Reconnection attempts made so far.
    pub reconnect_attempts: u64,
    /// Round-trip latency of the most recent successful heartbeat.
    pub last_heartbeat_latency: Option<Duration>,
    pub quality: QualityLevel,
    pub state: ConnectionState,
}

/// Error event delivered to `on_error` listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    /// Name of the subscription the error relates to, if any.
    pub subscription: Option<String>,
    pub message: String,
}
