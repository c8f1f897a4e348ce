//! Realtime client for the orderwire backend.
//!
//! Provides the connection manager with subscription tracking,
//! heartbeat quality monitoring and automatic reconnection.

pub mod error;
pub mod events;
pub(crate) mod heartbeat;
pub mod manager;
pub(crate) mod pumps;
pub(crate) mod reconnection;
pub mod registry;
pub mod transport;
pub mod types;
pub mod ws;

pub use error::{ConfigError, RegistryError, TransportError};
pub use events::ListenerHandle;
pub use manager::RealtimeManager;
pub use registry::Channel;
pub use transport::{Connection, Transport};
pub use types::{
    ConnectionState, ErrorEvent, ManagerConfig, QualityLevel, RealtimeStats, ReconnectConfig,
};
pub use ws::WsTransport;
