//! Test doubles for the device and the broker
//!
//! [`MockInterface`] stands in for the observer radio and is driven through
//! its paired [`MockDevice`]; [`MockBroker`] records what the bridge
//! publishes and can be taken offline or told to stop acknowledging.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcore_bridge::test_utils::{rx_line, MockBroker, MockInterface};
//!
//! let (iface, device) = MockInterface::new("mock");
//! let broker = MockBroker::new();
//! device.send_str(&rx_line(40, 4));
//! ```

use crate::broker::{BrokerConnector, BrokerSession};
use crate::error::{BridgeError, Result};
use crate::interface::ObserverInterface;
use crate::mapper::PublishAttempt;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

/// Format a `U RAW:` log line carrying `raw`
pub fn raw_line(raw: &[u8]) -> String {
    format!("12:34:56 - 1/2/2025 U RAW: {}\n", hex::encode_upper(raw))
}

/// Format a `U: RX` summary line
pub fn rx_line(len: usize, packet_type: u8) -> String {
    format!(
        "12:34:56 - 1/2/2025 U: RX, len={} (type={}, route=F, payload_len={}) SNR=9 RSSI=-71 score=1000 time=123 hash=5A3C9F01\n",
        len,
        packet_type,
        len.saturating_sub(2)
    )
}

/// Bytes of a flood-routed advertisement from `key`
pub fn advert_packet(key: [u8; 32]) -> Vec<u8> {
    let mut raw = vec![(0x04 << 2) | 0x01, 0x00];
    raw.extend_from_slice(&key);
    raw.extend_from_slice(&[0x11; 4 + 64]);
    raw.extend_from_slice(b"\x81Mock");
    raw
}

#[derive(Debug)]
enum DeviceEvent {
    Data(Bytes),
    Disconnect,
    Panic,
}

#[derive(Debug)]
struct DeviceState {
    plugged: AtomicBool,
    hang_on_close: AtomicBool,
    connects: AtomicUsize,
}

/// In-memory observer radio
#[derive(Debug)]
pub struct MockInterface {
    name: String,
    connected: bool,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    replies: VecDeque<Bytes>,
    responses: HashMap<String, String>,
    written: Vec<Vec<u8>>,
    state: Arc<DeviceState>,
}

/// Control side of a [`MockInterface`]
#[derive(Debug, Clone)]
pub struct MockDevice {
    events: mpsc::UnboundedSender<DeviceEvent>,
    state: Arc<DeviceState>,
}

impl MockInterface {
    /// Create an interface and the device that feeds it
    pub fn new(name: impl Into<String>) -> (Self, MockDevice) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(DeviceState {
            plugged: AtomicBool::new(true),
            hang_on_close: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        let iface = Self {
            name: name.into(),
            connected: false,
            events: rx,
            replies: VecDeque::new(),
            responses: HashMap::new(),
            written: Vec::new(),
            state: state.clone(),
        };
        (iface, MockDevice { events: tx, state })
    }

    /// Answer the CLI command `cmd` with `reply`
    pub fn respond(&mut self, cmd: &str, reply: &str) {
        self.responses.insert(cmd.to_string(), reply.to_string());
    }

    /// Commands written so far, without line endings
    pub fn written_commands(&self) -> Vec<String> {
        self.written
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end().to_string())
            .collect()
    }
}

#[async_trait]
impl ObserverInterface for MockInterface {
    async fn connect(&mut self) -> Result<()> {
        if !self.state.plugged.load(Ordering::SeqCst) {
            return Err(BridgeError::PortNotFound(self.name.clone()));
        }
        self.connected = true;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        if !self.connected {
            return Err(BridgeError::Disconnected);
        }
        if let Some(reply) = self.replies.pop_front() {
            return Ok(reply);
        }

        match self.events.recv().await {
            Some(DeviceEvent::Data(data)) => Ok(data),
            Some(DeviceEvent::Disconnect) => {
                self.connected = false;
                Err(BridgeError::Disconnected)
            }
            Some(DeviceEvent::Panic) => panic!("mock device panic"),
            None => std::future::pending().await,
        }
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(BridgeError::Disconnected);
        }
        self.written.push(data.to_vec());

        let cmd = String::from_utf8_lossy(data);
        if let Some(reply) = self.responses.get(cmd.trim_end()) {
            self.replies.push_back(Bytes::from(reply.clone()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MockDevice {
    /// Emit bytes on the serial line
    pub fn send(&self, data: Bytes) {
        let _ = self.events.send(DeviceEvent::Data(data));
    }

    /// Emit text on the serial line
    pub fn send_str(&self, text: &str) {
        self.send(Bytes::copy_from_slice(text.as_bytes()));
    }

    /// Pull the cable: the current read fails and reconnects are refused
    pub fn unplug(&self) {
        self.state.plugged.store(false, Ordering::SeqCst);
        let _ = self.events.send(DeviceEvent::Disconnect);
    }

    /// Allow reconnects again
    pub fn plug(&self) {
        self.state.plugged.store(true, Ordering::SeqCst);
    }

    /// Make the next read panic inside the reader
    pub fn panic_next(&self) {
        let _ = self.events.send(DeviceEvent::Panic);
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// From now on, closing the interface never completes
    pub fn hang_on_close(&self) {
        self.state.hang_on_close.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct BrokerState {
    available: watch::Sender<bool>,
    acking: watch::Sender<bool>,
    published: Mutex<Vec<PublishAttempt>>,
    wills: Mutex<Vec<PublishAttempt>>,
    connects: AtomicUsize,
    notify: Notify,
}

/// In-memory MQTT broker
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

/// Session opened on a [`MockBroker`]
#[derive(Debug)]
pub struct MockSession {
    state: Arc<BrokerState>,
    available: watch::Receiver<bool>,
    acking: watch::Receiver<bool>,
}

impl MockBroker {
    /// Create an available, acknowledging broker
    pub fn new() -> Self {
        let (available, _) = watch::channel(true);
        let (acking, _) = watch::channel(true);
        Self {
            state: Arc::new(BrokerState {
                available,
                acking,
                published: Mutex::new(Vec::new()),
                wills: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Take the broker offline (open sessions drop) or bring it back
    pub fn set_available(&self, available: bool) {
        self.state.available.send_replace(available);
    }

    /// While `false`, publishes wait for an acknowledgement that never comes
    pub fn set_acking(&self, acking: bool) {
        self.state.acking.send_replace(acking);
    }

    /// Every acknowledged publish, in order
    pub fn published(&self) -> Vec<PublishAttempt> {
        self.state.published.lock().clone()
    }

    /// Acknowledged publishes on `topic`
    pub fn published_on(&self, topic: &str) -> Vec<PublishAttempt> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|a| a.topic == topic)
            .cloned()
            .collect()
    }

    /// Last wills registered by each connect
    pub fn wills(&self) -> Vec<PublishAttempt> {
        self.state.wills.lock().clone()
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` publishes have been acknowledged
    pub async fn wait_for_publishes(&self, n: usize) -> Vec<PublishAttempt> {
        loop {
            let notified = self.state.notify.notified();
            {
                let published = self.state.published.lock();
                if published.len() >= n {
                    return published.clone();
                }
            }
            notified.await;
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    type Session = MockSession;

    async fn connect(&self, will: &PublishAttempt) -> Result<MockSession> {
        if !*self.state.available.borrow() {
            return Err(BridgeError::BrokerConnect("mock broker offline".into()));
        }
        self.state.wills.lock().push(will.clone());
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            state: self.state.clone(),
            available: self.state.available.subscribe(),
            acking: self.state.acking.subscribe(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn publish(&mut self, attempt: &PublishAttempt) -> Result<()> {
        let Self {
            state,
            available,
            acking,
        } = self;
        if !*available.borrow() {
            return Err(BridgeError::BrokerDisconnected("mock broker offline".into()));
        }

        let acked = tokio::select! {
            acked = async { acking.wait_for(|acking| *acking).await.is_ok() } => acked,
            _ = async { available.wait_for(|available| !*available).await.is_ok() } => false,
        };
        if !acked {
            return Err(BridgeError::BrokerDisconnected("mock broker offline".into()));
        }

        state.published.lock().push(attempt.clone());
        state.notify.notify_waiters();
        Ok(())
    }

    async fn poll(&mut self) -> Result<()> {
        let _ = self.available.wait_for(|available| !*available).await.is_ok();
        Err(BridgeError::BrokerDisconnected("mock broker offline".into()))
    }

    async fn disconnect(&mut self) {}
}
