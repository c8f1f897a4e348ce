//! Error types for the realtime client.

use tokio_tungstenite::tungstenite;

/// Invalid manager configuration. Fatal at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_subscriptions must be greater than zero")]
    ZeroMaxSubscriptions,

    #[error("heartbeat_interval must be greater than zero")]
    ZeroHeartbeatInterval,
}

/// Errors from the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    /// The backend rejected a request (e.g. an unauthorized channel).
    /// Not retried automatically.
    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },
}

/// Errors from the subscription registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The active-subscription ceiling was reached. Expected and
    /// recoverable; the facade surfaces this as a `None` result.
    #[error("subscription limit reached ({limit})")]
    LimitExceeded { limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TransportError::Timeout;
        assert_eq!(err.to_string(), "request timed out");

        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "connection closed");

        let err = TransportError::Backend {
            code: 403,
            message: "channel not allowed".into(),
        };
        assert!(err.to_string().contains("403"));

        let err = RegistryError::LimitExceeded { limit: 10 };
        assert_eq!(err.to_string(), "subscription limit reached (10)");
    }

    #[test]
    fn config_error_display() {
        assert!(
            ConfigError::ZeroMaxSubscriptions
                .to_string()
                .contains("max_subscriptions")
        );
        assert!(
            ConfigError::ZeroHeartbeatInterval
                .to_string()
                .contains("heartbeat_interval")
        );
    }
}
