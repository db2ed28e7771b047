//! Serial connection manager
//!
//! Owns the device interface and the frame decoder and runs the serial
//! side of the bridge:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (I/O error) -> Backoff -> Connecting ...
//! ```
//!
//! Decoded frames are handed to a [`FrameSink`]; the manager never waits on
//! the broker side.
//!
//! The manager is the only owner of the device, so CLI exchanges made while
//! the bridge runs (statistics polling) go through it as [`StatsRequest`]s.
//! Log lines printed during such an exchange are decoded like any other.

use crate::backoff::Backoff;
use crate::cli::CliSession;
use crate::codec::{FrameDecoder, RawFrame};
use crate::config::{ReconnectConfig, SerialConfig};
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, ObserverInterface, StatePublisher};
use crate::status::{bump, BridgeCounters, DeviceStats};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::error::Elapsed;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback receiving every decoded frame, in arrival order
pub type FrameSink = Arc<dyn Fn(RawFrame) + Send + Sync>;

/// Callback receiving firmware `DEBUG` lines
pub type DebugSink = Arc<dyn Fn(String) + Send + Sync>;

/// Reply slot of a device statistics request
pub type StatsRequest = oneshot::Sender<DeviceStats>;

enum Wake {
    Read(std::result::Result<Result<Bytes>, Elapsed>),
    Stats(StatsRequest),
}

/// Serial side of the bridge
pub struct SerialManager<I: ObserverInterface> {
    iface: I,
    decoder: FrameDecoder,
    stall_timeout: Duration,
    backoff: Backoff,
    state: StatePublisher,
    counters: Arc<BridgeCounters>,
    sink: FrameSink,
    debug_sink: Option<DebugSink>,
    stats_requests: Option<mpsc::Receiver<StatsRequest>>,
    seed: Option<Bytes>,
    ever_connected: bool,
    recovering: bool,
}

impl<I: ObserverInterface> SerialManager<I> {
    /// Create a manager around an interface (which may already be open)
    pub fn new(
        iface: I,
        serial: &SerialConfig,
        reconnect: &ReconnectConfig,
        state: StatePublisher,
        counters: Arc<BridgeCounters>,
        sink: FrameSink,
    ) -> Self {
        Self {
            iface,
            decoder: FrameDecoder::new(serial.max_frame_len),
            stall_timeout: serial.stall_timeout,
            backoff: Backoff::new(reconnect),
            state,
            counters,
            sink,
            debug_sink: None,
            stats_requests: None,
            seed: None,
            ever_connected: false,
            recovering: false,
        }
    }

    /// Decode `data` right after the first connect, ahead of new reads
    ///
    /// Used for output the device printed while the interface was borrowed
    /// for startup queries.
    pub fn with_captured_input(mut self, data: Bytes) -> Self {
        self.seed = Some(data);
        self
    }

    /// Serve statistics requests arriving on `requests`
    pub fn with_stats_requests(mut self, requests: mpsc::Receiver<StatsRequest>) -> Self {
        self.stats_requests = Some(requests);
        self
    }

    /// Forward firmware `DEBUG` lines to `sink`
    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.decoder = std::mem::take(&mut self.decoder).with_debug_lines(true);
        self.debug_sink = Some(sink);
        self
    }

    /// Run until `cancel` fires
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            if self.recovering {
                self.recovering = false;
                if let Err(e) = self.iface.disconnect().await {
                    debug!(error = %e, "Error closing serial interface");
                }
                if !self.wait_backoff(&cancel).await {
                    break;
                }
            }

            if !self.iface.is_connected() && !self.open(&cancel).await {
                if cancel.is_cancelled() {
                    break;
                }
                if !self.wait_backoff(&cancel).await {
                    break;
                }
                continue;
            }

            if self.ever_connected {
                bump(&self.counters.serial_reconnects);
            }
            self.ever_connected = true;
            self.decoder.reset();
            if let Some(seed) = self.seed.take() {
                self.ingest(&seed);
            }
            self.state.set(ConnectionState::Connected);
            self.backoff.connected(Instant::now());

            let Some(err) = self.read_loop(&cancel).await else {
                break;
            };

            warn!(
                interface = self.iface.name(),
                error = %err,
                code = err.error_code(),
                "Serial connection lost"
            );
            if let Err(e) = self.iface.disconnect().await {
                debug!(error = %e, "Error closing serial interface");
            }
            self.decoder.reset();
            self.backoff.disconnected(Instant::now());
            if !self.wait_backoff(&cancel).await {
                break;
            }
        }

        if let Err(e) = self.iface.disconnect().await {
            debug!(error = %e, "Error closing serial interface");
        }
        self.state.set(ConnectionState::Disconnected);
        info!(interface = self.iface.name(), "Serial manager stopped");
    }

    /// Prepare for a restart after a panic inside [`SerialManager::run`]
    pub fn recover(&mut self) {
        self.decoder.reset();
        self.recovering = true;
        self.state.set(ConnectionState::Backoff);
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn open(&mut self, cancel: &CancellationToken) -> bool {
        self.state.set(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.iface.connect() => result,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(interface = self.iface.name(), error = %e, "Serial connect failed");
                false
            }
        }
    }

    /// Read and decode until an I/O error (returned) or cancellation (`None`)
    async fn read_loop(&mut self, cancel: &CancellationToken) -> Option<BridgeError> {
        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => return None,
                read = timeout(self.stall_timeout, self.iface.read_chunk()) => Wake::Read(read),
                Some(reply) = next_request(&mut self.stats_requests) => Wake::Stats(reply),
            };

            match wake {
                Wake::Read(Ok(Ok(chunk))) => self.ingest(&chunk),
                Wake::Read(Ok(Err(e))) => return Some(e),
                Wake::Read(Err(_)) => {
                    if self.decoder.has_partial() {
                        let dropped = self.decoder.discard_partial();
                        bump(&self.counters.frame_stalls);
                        warn!(dropped, "Serial line stalled, discarding partial frame");
                    }
                }
                Wake::Stats(reply) => {
                    if reply.is_closed() {
                        debug!("Dropping abandoned statistics request");
                        continue;
                    }
                    let mut session = CliSession::new(&mut self.iface);
                    let result = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = session.device_stats() => Some(result),
                    };
                    let captured = session.into_captured();
                    self.ingest(&captured);

                    match result {
                        None => return None,
                        Some(Ok(stats)) => {
                            let _ = reply.send(stats);
                        }
                        Some(Err(e)) => return Some(e),
                    }
                }
            }
        }
    }

    fn ingest(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.counters
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.decoder.feed(data);
        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        for result in self.decoder.frames() {
            match result {
                Ok(frame) => (self.sink)(frame),
                Err(e) => {
                    bump(&self.counters.framing_errors);
                    debug!(error = %e, "Framing error");
                }
            }
        }
        let ignored = self.decoder.take_ignored();
        if ignored > 0 {
            self.counters
                .ignored_lines
                .fetch_add(ignored, Ordering::Relaxed);
        }
        if let Some(sink) = &self.debug_sink {
            for line in self.decoder.take_debug_lines() {
                sink(line);
            }
        }
    }

    /// Sleep for the next backoff delay; `false` if cancelled meanwhile
    async fn wait_backoff(&mut self, cancel: &CancellationToken) -> bool {
        self.state.set(ConnectionState::Backoff);
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Serial reconnect backoff");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

/// Next statistics request; never resolves when none are served
async fn next_request(requests: &mut Option<mpsc::Receiver<StatsRequest>>) -> Option<StatsRequest> {
    match requests {
        Some(requests) => requests.recv().await,
        None => std::future::pending().await,
    }
}
