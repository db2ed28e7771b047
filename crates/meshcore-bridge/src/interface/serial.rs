//! Serial port interface for MeshCore observer radios
//!
//! Uses tokio-serial. Several candidate device paths may be configured;
//! each connect attempt tries them in order and keeps the first that opens.

use crate::config::SerialConfig;
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, ObserverInterface};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial interface for a MeshCore repeater in packet-logging mode
pub struct SerialInterface {
    /// Candidate port paths
    ports: Vec<String>,

    /// Baud rate
    baud_rate: u32,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Port currently open
    active_port: Option<String>,

    /// Current connection state
    state: ConnectionState,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface for a single port
    pub fn new(port: impl Into<String>) -> Self {
        let port = port.into();
        Self::with_ports(vec![port], crate::config::DEFAULT_BAUD_RATE)
    }

    /// Create from configuration
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::with_ports(config.ports.clone(), config.baud_rate)
    }

    fn with_ports(ports: Vec<String>, baud_rate: u32) -> Self {
        let name = format!("serial:{}", ports.join(","));
        Self {
            ports,
            baud_rate,
            stream: None,
            active_port: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Port currently open, if any
    pub fn active_port(&self) -> Option<&str> {
        self.active_port.as_deref()
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn open(&self, port: &str) -> Result<SerialStream> {
        if !Path::new(port).exists() {
            return Err(BridgeError::PortNotFound(port.to_string()));
        }
        tokio_serial::new(port, self.baud_rate)
            .open_native_async()
            .map_err(|e| BridgeError::PortOpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ObserverInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let mut last_error = BridgeError::PortNotFound(self.ports.join(","));

        for port in &self.ports {
            info!(port = %port, baud = self.baud_rate, "Connecting to serial port");
            match self.open(port) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.active_port = Some(port.clone());
                    self.state = ConnectionState::Connected;
                    info!(port = %port, "Connected to MeshCore device");
                    return Ok(());
                }
                Err(e) => {
                    warn!(port = %port, error = %e, "Failed to open serial port");
                    last_error = e;
                }
            }
        }

        self.state = ConnectionState::Disconnected;
        Err(last_error)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }

        self.state = ConnectionState::Disconnected;
        if let Some(port) = self.active_port.take() {
            info!(port = %port, "Disconnected from serial port");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    // EOF - device unplugged
                    self.state = ConnectionState::Disconnected;
                    return Err(BridgeError::Disconnected);
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from serial port");
                    return Ok(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Serial read error");
                    self.state = ConnectionState::Disconnected;
                    return Err(BridgeError::ReadError(e.to_string()));
                }
            }
        }
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        debug!(size = data.len(), "Writing to serial port");

        stream.write_all(data).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            BridgeError::WriteError(e.to_string())
        })?;

        stream
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("ports", &self.ports)
            .field("active_port", &self.active_port)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_state() {
        let iface = SerialInterface::new("/dev/ttyACM0");
        assert_eq!(iface.state(), ConnectionState::Disconnected);
        assert!(!iface.is_connected());
        assert!(iface.active_port().is_none());
    }

    #[test]
    fn test_interface_name_lists_ports() {
        let config = SerialConfig {
            ports: vec!["/dev/ttyUSB0".into(), "/dev/ttyACM0".into()],
            ..SerialConfig::default()
        };
        let iface = SerialInterface::from_config(&config);
        assert_eq!(iface.name(), "serial:/dev/ttyUSB0,/dev/ttyACM0");
    }

    #[tokio::test]
    async fn test_connect_missing_port() {
        let mut iface = SerialInterface::new("/dev/does-not-exist-meshcore");
        let err = iface.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::PortNotFound(_)));
        assert!(err.is_retriable());
        assert_eq!(iface.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_when_disconnected() {
        let mut iface = SerialInterface::new("/dev/ttyACM0");
        assert!(matches!(
            iface.read_chunk().await,
            Err(BridgeError::Disconnected)
        ));
    }
}
