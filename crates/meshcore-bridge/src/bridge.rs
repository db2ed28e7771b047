//! MeshcoreBridge - observer radio to MQTT service
//!
//! Wires the two connection managers together and owns the process
//! lifecycle:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         MeshcoreBridge                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌───────────────┐  frame sink  ┌────────────┐  ┌─────────────┐  │
//! │  │ SerialManager │─────────────►│ Classifier │─►│   Mapper    │  │
//! │  │ (decoder)     │              └────────────┘  └──────┬──────┘  │
//! │  └───────────────┘                                     │         │
//! │        ▲ stats          status ticker ─────────►┌──────▼──────┐  │
//! │                                                 │PublishQueue │  │
//! │  ┌───────────────┐                              └──────┬──────┘  │
//! │  │ BrokerManager │◄────────────────────────────────────┘         │
//! │  └───────────────┘                                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both managers run as supervised tasks: a panic is caught, logged and the
//! manager restarts from `Backoff`.
//!
//! The status ticker asks the serial manager for device statistics before
//! each heartbeat. Shutdown queues the offline status first, then gives both
//! tasks one shared deadline to finish.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcore_bridge::{BridgeConfig, MeshcoreBridge, MqttConnector, SerialInterface};
//!
//! let config = BridgeConfig::from_env()?;
//! let interface = SerialInterface::from_config(&config.serial);
//! let connector = MqttConnector::new(config.broker.clone());
//! let bridge = MeshcoreBridge::new(config, interface, connector);
//! let handle = bridge.handle();
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! });
//! bridge.run().await?;
//! ```

use crate::backoff::Backoff;
use crate::broker::{BrokerConnector, BrokerManager};
use crate::classifier::{classify, ReceivedAt};
use crate::cli::{self, CliSession};
use crate::codec::RawFrame;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::identity::ObserverIdentity;
use crate::interface::{ConnectionState, ObserverInterface, StatePublisher, StateWatch};
use crate::mapper::PayloadMapper;
use crate::queue::{PublishQueue, PushOutcome};
use crate::serial_manager::{DebugSink, FrameSink, SerialManager, StatsRequest};
use crate::status::{
    bump, BridgeCounters, CounterSnapshot, DeviceStats, Presence, StatusSnapshot,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Local;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the status ticker waits for device statistics
const DEVICE_STATS_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for observing and stopping a running bridge
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    shutdown: CancellationToken,
    counters: Arc<BridgeCounters>,
    serial: StateWatch,
    broker: StateWatch,
    started: Instant,
}

impl BridgeHandle {
    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Current counter values
    pub fn stats(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Serial transport state
    pub fn serial_state(&self) -> ConnectionState {
        self.serial.get()
    }

    /// Broker transport state
    pub fn broker_state(&self) -> ConnectionState {
        self.broker.get()
    }

    /// Watch the serial transport state
    pub fn watch_serial(&self) -> StateWatch {
        self.serial.clone()
    }

    /// Watch the broker transport state
    pub fn watch_broker(&self) -> StateWatch {
        self.broker.clone()
    }

    /// Time since the bridge was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Bridge between a MeshCore observer radio and an MQTT broker
pub struct MeshcoreBridge<I: ObserverInterface, C: BrokerConnector> {
    config: BridgeConfig,
    interface: I,
    connector: C,
    counters: Arc<BridgeCounters>,
    serial_state: StatePublisher,
    broker_state: StatePublisher,
    shutdown: CancellationToken,
    started: Instant,
}

impl<I, C> MeshcoreBridge<I, C>
where
    I: ObserverInterface + 'static,
    C: BrokerConnector,
{
    /// Create a bridge; nothing is opened until [`MeshcoreBridge::run`]
    pub fn new(config: BridgeConfig, interface: I, connector: C) -> Self {
        Self {
            config,
            interface,
            connector,
            counters: Arc::new(BridgeCounters::new()),
            serial_state: StatePublisher::new("serial"),
            broker_state: StatePublisher::new("broker"),
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// Get a handle for this bridge
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shutdown: self.shutdown.clone(),
            counters: self.counters.clone(),
            serial: self.serial_state.watch(),
            broker: self.broker_state.watch(),
            started: self.started,
        }
    }

    /// Run until shutdown is requested
    ///
    /// Only configuration problems are returned as errors; transport
    /// failures are retried for as long as the bridge runs.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            mut interface,
            mut connector,
            counters,
            serial_state,
            broker_state,
            shutdown,
            started,
        } = self;

        info!(
            interface = interface.name(),
            broker = connector.name(),
            "Starting MeshCore bridge"
        );

        let resolved =
            match resolve_identity(&mut interface, &config, &serial_state, &shutdown).await? {
                Some(resolved) => resolved,
                None => {
                    info!("Shutdown requested before the observer identity was known");
                    if let Err(e) = interface.disconnect().await {
                        debug!(error = %e, "Error closing interface");
                    }
                    serial_state.set(ConnectionState::Disconnected);
                    return Ok(());
                }
            };
        let identity = Arc::new(resolved.identity);
        connector.bind_identity(&identity);

        let mapper = Arc::new(PayloadMapper::new(
            identity.clone(),
            &config.topics,
            &config.broker,
        ));
        let will = mapper.last_will()?;
        let queue = Arc::new(PublishQueue::new(config.queue_capacity, counters.clone()));
        info!(
            packets = mapper.packets_topic(),
            status = mapper.status_topic(),
            "Publishing observer traffic"
        );

        let (stats_requests, stats_rx) = mpsc::channel(1);
        let mut serial = SerialManager::new(
            interface,
            &config.serial,
            &config.reconnect,
            serial_state.clone(),
            counters.clone(),
            frame_sink(mapper.clone(), queue.clone(), counters.clone()),
        )
        .with_captured_input(resolved.captured)
        .with_stats_requests(stats_rx);
        if config.debug {
            match mapper.debug_topic() {
                Some(topic) => {
                    info!(topic, "Publishing firmware debug lines");
                    serial = serial.with_debug_sink(debug_sink(mapper.clone(), queue.clone()));
                }
                None => warn!("Debug publishing requested but no debug topic is configured"),
            }
        }
        let broker = BrokerManager::new(
            connector,
            will,
            &config.broker,
            &config.reconnect,
            queue.clone(),
            counters.clone(),
            broker_state.clone(),
        );

        let serial_cancel = shutdown.child_token();
        let broker_cancel = CancellationToken::new();
        let mut serial_task = tokio::spawn(supervise(serial, serial_cancel.clone()));
        let mut broker_task = tokio::spawn(supervise(broker, broker_cancel.clone()));

        let mut status = StatusSource {
            mapper,
            queue: queue.clone(),
            counters,
            serial: serial_state.watch(),
            broker: broker_state.watch(),
            started,
            device: None,
            stats_requests,
        };
        status.record_device(resolved.device);

        let period = config.status_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let polled = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        polled = status.poll_device() => polled,
                    };
                    if let Some(stats) = polled {
                        status.record_device(stats);
                    }
                    let snapshot = status.submit(Presence::Online);
                    info!("{}", snapshot.service_log_line());
                }
            }
        }

        info!("Shutting down bridge");
        let deadline = Instant::now() + config.shutdown_timeout;
        serial_cancel.cancel();
        status.submit(Presence::Offline);
        queue.close();

        match timeout_at(deadline, &mut serial_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Serial task ended abnormally"),
            Err(_) => {
                warn!("Serial task did not stop before the shutdown deadline");
                serial_task.abort();
            }
        }

        match timeout_at(deadline, &mut broker_task).await {
            Ok(Ok(())) => info!("Publish queue flushed"),
            Ok(Err(e)) => warn!(error = %e, "Broker task ended abnormally"),
            Err(_) => {
                warn!(
                    abandoned = queue.len(),
                    timeout_ms = config.shutdown_timeout.as_millis() as u64,
                    "Shutdown timeout, abandoning queued messages"
                );
                broker_cancel.cancel();
                broker_task.abort();
            }
        }

        info!("MeshCore bridge stopped");
        Ok(())
    }
}

/// Builds status snapshots and submits them to the queue
struct StatusSource {
    mapper: Arc<PayloadMapper>,
    queue: Arc<PublishQueue>,
    counters: Arc<BridgeCounters>,
    serial: StateWatch,
    broker: StateWatch,
    started: Instant,
    device: Option<DeviceStats>,
    stats_requests: mpsc::Sender<StatsRequest>,
}

impl StatusSource {
    fn submit(&self, presence: Presence) -> StatusSnapshot {
        let snapshot = StatusSnapshot::capture(
            presence,
            self.started.elapsed(),
            &self.counters,
            self.serial.get(),
            self.broker.get(),
            self.device.clone(),
        );
        match self.mapper.status(&snapshot) {
            Ok(attempt) => {
                let outcome = self.queue.push(attempt);
                debug!(presence = presence.as_str(), ?outcome, "Status submitted");
            }
            Err(e) => warn!(error = %e, "Failed to encode status"),
        }
        snapshot
    }

    /// Ask the serial manager for fresh statistics
    ///
    /// `None` while the device is not connected or when it does not answer
    /// in time; the previous statistics are then reported again.
    async fn poll_device(&self) -> Option<DeviceStats> {
        if self.serial.get() != ConnectionState::Connected {
            return None;
        }
        let (reply, stats) = oneshot::channel();
        if self.stats_requests.try_send(reply).is_err() {
            debug!("Statistics request already pending");
            return None;
        }
        match timeout(DEVICE_STATS_TIMEOUT, stats).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(_)) => {
                debug!("Statistics request dropped by the serial manager");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = DEVICE_STATS_TIMEOUT.as_millis() as u64,
                    "Device statistics timed out"
                );
                None
            }
        }
    }

    /// Keep non-empty statistics and log the `[DEVICE]` line
    fn record_device(&mut self, stats: DeviceStats) {
        if stats.is_empty() {
            return;
        }
        let previous = self.device.replace(stats);
        if let Some(line) = self
            .device
            .as_ref()
            .and_then(|device| device.log_line(previous.as_ref()))
        {
            info!("{}", line);
        }
    }
}

/// Decoder output to queue: classify, count, map, push
fn frame_sink(
    mapper: Arc<PayloadMapper>,
    queue: Arc<PublishQueue>,
    counters: Arc<BridgeCounters>,
) -> FrameSink {
    Arc::new(move |frame: RawFrame| {
        let packet = classify(frame, ReceivedAt::now());
        counters.record_packet(&packet);
        debug!(
            kind = packet.kind.as_str(),
            direction = %packet.summary.direction,
            len = packet.summary.len,
            "Packet decoded"
        );

        let attempt = match mapper.packet(&packet) {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(error = %e, "Failed to encode packet");
                return;
            }
        };
        match queue.push(attempt) {
            PushOutcome::Closed => debug!("Publish queue closed, packet not sent"),
            _ => bump(&counters.packets_queued),
        }
    })
}

/// Debug lines to queue, when a debug topic is configured
fn debug_sink(mapper: Arc<PayloadMapper>, queue: Arc<PublishQueue>) -> DebugSink {
    Arc::new(move |line: String| match mapper.debug(&line, &Local::now()) {
        Ok(Some(attempt)) => {
            if queue.push(attempt) == PushOutcome::Closed {
                debug!("Publish queue closed, debug line not sent");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to encode debug line"),
    })
}

/// Result of the startup exchange with the device
struct Resolved {
    identity: ObserverIdentity,
    device: DeviceStats,
    /// Device output read while waiting for replies
    captured: Bytes,
}

/// Observer identity from configuration and the device CLI
///
/// The device is always asked for the fields that are not configured,
/// plus its statistics. When a public key is configured a single failed
/// attempt is enough to fall back to the configured values; otherwise the
/// exchange is retried with backoff. `Ok(None)` means shutdown was
/// requested first.
async fn resolve_identity<I: ObserverInterface>(
    iface: &mut I,
    config: &BridgeConfig,
    state: &StatePublisher,
    shutdown: &CancellationToken,
) -> Result<Option<Resolved>> {
    let configured = cli::configured_identity(&config.observer).transpose()?;

    let mut backoff = Backoff::new(&config.reconnect);
    loop {
        state.set(ConnectionState::Connecting);
        let attempt = async {
            if !iface.is_connected() {
                iface.connect().await?;
            }
            let mut session = CliSession::new(&mut *iface);
            let identity = session.identity(&config.observer).await?;
            let device = session.device_stats().await?;
            Ok::<_, BridgeError>(Resolved {
                identity,
                device,
                captured: session.into_captured(),
            })
        };
        let result = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            result = attempt => result,
        };

        match result {
            Ok(resolved) => return Ok(Some(resolved)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.error_code(),
                    "Could not read observer identity from device"
                );
                if let Err(e) = iface.disconnect().await {
                    debug!(error = %e, "Error closing interface");
                }
                if let Some(identity) = configured.clone() {
                    info!("Continuing with the configured observer identity");
                    return Ok(Some(Resolved {
                        identity,
                        device: DeviceStats::default(),
                        captured: Bytes::new(),
                    }));
                }
                state.set(ConnectionState::Backoff);
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = sleep(backoff.next_delay()) => {}
                }
            }
        }
    }
}

/// A long-running manager that can be restarted after a panic
#[async_trait]
trait Supervised: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(&mut self, cancel: CancellationToken);

    fn recover(&mut self);
}

#[async_trait]
impl<I: ObserverInterface + 'static> Supervised for SerialManager<I> {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn run(&mut self, cancel: CancellationToken) {
        SerialManager::run(self, cancel).await
    }

    fn recover(&mut self) {
        SerialManager::recover(self)
    }
}

#[async_trait]
impl<C: BrokerConnector> Supervised for BrokerManager<C> {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn run(&mut self, cancel: CancellationToken) {
        BrokerManager::run(self, cancel).await
    }

    fn recover(&mut self) {
        BrokerManager::recover(self)
    }
}

async fn supervise<T: Supervised>(mut task: T, cancel: CancellationToken) {
    loop {
        let outcome = AssertUnwindSafe(task.run(cancel.clone()))
            .catch_unwind()
            .await;
        let Err(panic) = outcome else {
            break;
        };

        error!(
            task = task.name(),
            reason = panic_message(panic.as_ref()),
            "Task panicked, restarting"
        );
        if cancel.is_cancelled() {
            break;
        }
        task.recover();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfigBuilder;
    use crate::test_utils::{MockBroker, MockInterface};

    const KEY: &str = "ABCD1234";

    fn config() -> BridgeConfig {
        BridgeConfigBuilder::new()
            .serial_port("/dev/mock")
            .public_key(KEY)
            .region("ITA")
            .build()
    }

    async fn resolve(iface: &mut MockInterface, config: &BridgeConfig) -> Result<Option<Resolved>> {
        let state = StatePublisher::new("serial");
        resolve_identity(iface, config, &state, &CancellationToken::new()).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_publishes_offline_status() {
        let (iface, _device) = MockInterface::new("mock");
        let broker = MockBroker::new();
        let bridge = MeshcoreBridge::new(config(), iface, broker.clone());
        let handle = bridge.handle();

        let task = tokio::spawn(bridge.run());
        let mut watch = handle.watch_broker();
        assert!(watch.wait_for(ConnectionState::Connected).await);
        handle.shutdown();
        task.await.unwrap().unwrap();

        let published = broker.published_on("meshcore/ITA/ABCD1234/status");
        assert_eq!(published.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["status"], "offline");
        assert!(published[0].retain);
        assert_eq!(broker.wills()[0].topic, "meshcore/ITA/ABCD1234/status");
        assert_eq!(handle.broker_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_identity_unknown() {
        let (iface, device) = MockInterface::new("mock");
        device.unplug();
        let broker = MockBroker::new();
        let mut config = config();
        config.observer.public_key = None;
        let bridge = MeshcoreBridge::new(config, iface, broker.clone());
        let handle = bridge.handle();

        let task = tokio::spawn(bridge.run());
        sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.serial_state(), ConnectionState::Backoff);
        handle.shutdown();
        task.await.unwrap().unwrap();

        assert_eq!(broker.connect_count(), 0);
        assert_eq!(handle.serial_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_configured_key_is_fatal() {
        let (iface, _device) = MockInterface::new("mock");
        let mut config = config();
        config.observer.public_key = Some("not hex".into());
        let bridge = MeshcoreBridge::new(config, iface, MockBroker::new());

        let err = bridge.run().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_key_still_queries_device() {
        let (mut iface, device) = MockInterface::new("mock");
        iface.respond("get name", "  -> > Hilltop\r\n");
        iface.respond("ver", "  -> 1.8.2 (Build: 04-Sep-2025)\r\n");
        iface.respond("stats-core", "  -> {\"battery_mv\":4050}\r\n");
        device.send_str("12:00:00 - 1/1/2025 U RAW: 1100AA\n");

        let resolved = resolve(&mut iface, &config()).await.unwrap().unwrap();
        assert_eq!(resolved.identity.public_key, KEY);
        assert_eq!(resolved.identity.name.as_deref(), Some("Hilltop"));
        assert_eq!(
            resolved.identity.firmware_version.as_deref(),
            Some("1.8.2 (Build: 04-Sep-2025)")
        );
        assert_eq!(resolved.device.battery_mv, Some(4050.into()));
        assert!(String::from_utf8_lossy(&resolved.captured).contains("U RAW: 1100AA"));

        let written = iface.written_commands();
        assert!(written[0].starts_with("time "));
        assert!(!written.iter().any(|c| c == "get public.key"));
        assert!(iface.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_key_used_when_device_absent() {
        let (mut iface, device) = MockInterface::new("mock");
        device.unplug();

        let resolved = resolve(&mut iface, &config()).await.unwrap().unwrap();
        assert_eq!(resolved.identity.public_key, KEY);
        assert!(resolved.identity.firmware_version.is_none());
        assert!(resolved.device.is_empty());
        assert!(resolved.captured.is_empty());
        assert_eq!(device.connect_count(), 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
