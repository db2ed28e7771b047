//! Device interfaces for the observer radio
//!
//! - [`serial::SerialInterface`] - Serial port communication (requires `serial` feature)
//! - [`crate::test_utils::MockInterface`] - In-memory interface for tests
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Trait for observer device interfaces
///
/// Implementations must keep [`ObserverInterface::read_chunk`] cancel-safe:
/// callers race it against timers and shutdown.
#[async_trait]
pub trait ObserverInterface: Send + Sync {
    /// Open the device
    async fn connect(&mut self) -> Result<()>;

    /// Close the device
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Wait for the next bytes from the device
    ///
    /// End of stream is reported as [`crate::BridgeError::Disconnected`].
    async fn read_chunk(&mut self) -> Result<Bytes>;

    /// Write bytes to the device
    async fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Waiting before the next connection attempt
    Backoff,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
        }
    }
}

/// Write side of a transport state, owned by its connection manager
#[derive(Debug, Clone)]
pub struct StatePublisher {
    name: &'static str,
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StatePublisher {
    /// Create a publisher starting in `Disconnected`
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    /// Move to a new state
    pub fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(transport = self.name, from = %previous, to = %state, "State change");
        }
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Read-only view for other components
    pub fn watch(&self) -> StateWatch {
        StateWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of a transport state
#[derive(Debug, Clone)]
pub struct StateWatch {
    rx: watch::Receiver<ConnectionState>,
}

impl StateWatch {
    /// Current state
    pub fn get(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    /// Wait until the transport reaches `state`
    ///
    /// Returns `false` if the owning manager has gone away.
    pub async fn wait_for(&mut self, state: ConnectionState) -> bool {
        self.rx.wait_for(|s| *s == state).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[tokio::test]
    async fn test_state_watch_follows_publisher() {
        let publisher = StatePublisher::new("serial");
        let mut watch = publisher.watch();
        assert_eq!(watch.get(), ConnectionState::Disconnected);

        let setter = publisher.clone();
        tokio::spawn(async move {
            setter.set(ConnectionState::Connecting);
            setter.set(ConnectionState::Connected);
        });

        assert!(watch.wait_for(ConnectionState::Connected).await);
        assert_eq!(publisher.get(), ConnectionState::Connected);
    }
}
