//! Bridge counters and status snapshots
//!
//! Counters are plain atomics shared between the serial and broker tasks;
//! neither side ever waits on the other to update them. A
//! [`StatusSnapshot`] is assembled from them on every heartbeat tick,
//! together with the latest [`DeviceStats`] polled from the repeater.

use crate::classifier::{DecodedPacket, PacketKind};
use crate::codec::Direction;
use crate::interface::ConnectionState;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Shared bridge counters
#[derive(Debug, Default)]
pub struct BridgeCounters {
    /// Packets received over the air
    pub packets_rx: AtomicU64,
    /// Packets transmitted by the observer
    pub packets_tx: AtomicU64,
    /// Advertisement packets
    pub adverts: AtomicU64,
    /// Path and trace packets
    pub paths: AtomicU64,
    /// Data-bearing packets
    pub telemetry: AtomicU64,
    /// Packets not structurally parsed
    pub unknown: AtomicU64,
    /// Packet attempts accepted by the queue
    pub packets_queued: AtomicU64,
    /// Packet attempts delivered to the broker
    pub packets_published: AtomicU64,
    /// Packet attempts evicted under backpressure
    pub packets_dropped: AtomicU64,
    /// Status messages delivered to the broker
    pub statuses_published: AtomicU64,
    /// Pending status messages replaced by a newer one
    pub statuses_coalesced: AtomicU64,
    /// Recoverable framing errors
    pub framing_errors: AtomicU64,
    /// Partial lines discarded after a stall
    pub frame_stalls: AtomicU64,
    /// Serial lines that were not part of a frame
    pub ignored_lines: AtomicU64,
    /// Bytes read from the serial device
    pub bytes_received: AtomicU64,
    /// Failed or timed out publishes
    pub publish_failures: AtomicU64,
    /// Serial reconnections
    pub serial_reconnects: AtomicU64,
    /// Broker reconnections
    pub broker_reconnects: AtomicU64,
    /// Wall-clock millis of the last packet, 0 if none yet
    last_packet_ms: AtomicI64,
}

/// Increment a counter by one
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BridgeCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a classified packet
    pub fn record_packet(&self, packet: &DecodedPacket) {
        match packet.summary.direction {
            Direction::Rx => bump(&self.packets_rx),
            Direction::Tx => bump(&self.packets_tx),
        }
        match packet.kind {
            PacketKind::Advertisement => bump(&self.adverts),
            PacketKind::Path => bump(&self.paths),
            PacketKind::Telemetry => bump(&self.telemetry),
            PacketKind::Unknown => bump(&self.unknown),
        }
        self.last_packet_ms
            .store(packet.received_at.wall.timestamp_millis(), Ordering::Relaxed);
    }

    /// Wall-clock time of the last packet
    pub fn last_packet_at(&self) -> Option<DateTime<Local>> {
        match self.last_packet_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Local.timestamp_millis_opt(ms).single(),
        }
    }

    /// Copy every counter
    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            packets_rx: get(&self.packets_rx),
            packets_tx: get(&self.packets_tx),
            adverts: get(&self.adverts),
            paths: get(&self.paths),
            telemetry: get(&self.telemetry),
            unknown: get(&self.unknown),
            packets_queued: get(&self.packets_queued),
            packets_published: get(&self.packets_published),
            packets_dropped: get(&self.packets_dropped),
            statuses_published: get(&self.statuses_published),
            statuses_coalesced: get(&self.statuses_coalesced),
            framing_errors: get(&self.framing_errors),
            frame_stalls: get(&self.frame_stalls),
            ignored_lines: get(&self.ignored_lines),
            bytes_received: get(&self.bytes_received),
            publish_failures: get(&self.publish_failures),
            serial_reconnects: get(&self.serial_reconnects),
            broker_reconnects: get(&self.broker_reconnects),
        }
    }
}

/// Point-in-time copy of [`BridgeCounters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Packets received over the air
    pub packets_rx: u64,
    /// Packets transmitted by the observer
    pub packets_tx: u64,
    /// Advertisement packets
    pub adverts: u64,
    /// Path and trace packets
    pub paths: u64,
    /// Data-bearing packets
    pub telemetry: u64,
    /// Packets not structurally parsed
    pub unknown: u64,
    /// Packet attempts accepted by the queue
    pub packets_queued: u64,
    /// Packet attempts delivered to the broker
    pub packets_published: u64,
    /// Packet attempts evicted under backpressure
    pub packets_dropped: u64,
    /// Status messages delivered to the broker
    pub statuses_published: u64,
    /// Pending status messages replaced by a newer one
    pub statuses_coalesced: u64,
    /// Recoverable framing errors
    pub framing_errors: u64,
    /// Partial lines discarded after a stall
    pub frame_stalls: u64,
    /// Serial lines that were not part of a frame
    pub ignored_lines: u64,
    /// Bytes read from the serial device
    pub bytes_received: u64,
    /// Failed or timed out publishes
    pub publish_failures: u64,
    /// Serial reconnections
    pub serial_reconnects: u64,
    /// Broker reconnections
    pub broker_reconnects: u64,
}

/// Repeater statistics from the `stats-core` and `stats-radio` commands
///
/// Numbers are kept exactly as the firmware printed them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Supply voltage in millivolts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_mv: Option<Number>,
    /// Device uptime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<Number>,
    /// Firmware error counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Number>,
    /// Outbound packet queue length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<Number>,
    /// Radio noise floor in dB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_floor: Option<Number>,
    /// Cumulative transmit airtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_air_secs: Option<Number>,
    /// Cumulative receive airtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_air_secs: Option<Number>,
}

impl DeviceStats {
    /// Whether the device reported nothing
    pub fn is_empty(&self) -> bool {
        *self == DeviceStats::default()
    }

    /// Take every field `other` reports
    pub fn merge(&mut self, other: DeviceStats) {
        let DeviceStats {
            battery_mv,
            uptime_secs,
            errors,
            queue_len,
            noise_floor,
            tx_air_secs,
            rx_air_secs,
        } = other;
        self.battery_mv = battery_mv.or(self.battery_mv.take());
        self.uptime_secs = uptime_secs.or(self.uptime_secs.take());
        self.errors = errors.or(self.errors.take());
        self.queue_len = queue_len.or(self.queue_len.take());
        self.noise_floor = noise_floor.or(self.noise_floor.take());
        self.tx_air_secs = tx_air_secs.or(self.tx_air_secs.take());
        self.rx_air_secs = rx_air_secs.or(self.rx_air_secs.take());
    }

    /// `[DEVICE]` log line; airtime is reported since `previous` when given
    pub fn log_line(&self, previous: Option<&DeviceStats>) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(noise) = &self.noise_floor {
            parts.push(format!("Noise: {}dB", noise));
        }

        let f = |n: &Option<Number>| n.as_ref().and_then(Number::as_f64);
        match (f(&self.tx_air_secs), f(&self.rx_air_secs), f(&self.uptime_secs)) {
            (Some(tx), Some(rx), Some(uptime)) => {
                let prev = previous.and_then(|p| {
                    Some((f(&p.tx_air_secs)?, f(&p.rx_air_secs)?, f(&p.uptime_secs)?))
                });
                match prev {
                    Some((prev_tx, prev_rx, prev_uptime)) => {
                        let (tx_delta, rx_delta) = (tx - prev_tx, rx - prev_rx);
                        let window = uptime - prev_uptime;
                        if window > 0.0 {
                            parts.push(format!(
                                "Air: Tx {:.1}s ({:.2}%), Rx {:.1}s ({:.2}%)",
                                tx_delta,
                                tx_delta / window * 100.0,
                                rx_delta,
                                rx_delta / window * 100.0
                            ));
                        } else {
                            parts.push(format!("Air: Tx {:.1}s, Rx {:.1}s", tx_delta, rx_delta));
                        }
                    }
                    None => parts.push(format!("Air: Tx {}s, Rx {}s", tx, rx)),
                }
            }
            (Some(tx), Some(rx), None) => parts.push(format!("Air: Tx {}s, Rx {}s", tx, rx)),
            _ => {}
        }

        if let Some(battery) = &self.battery_mv {
            parts.push(format!("Battery: {}mV", battery));
        }
        if let Some(uptime) = self.uptime_secs.as_ref().and_then(Number::as_u64) {
            let (hours, minutes) = (uptime / 3600, uptime % 3600 / 60);
            if hours > 0 {
                parts.push(format!("Uptime: {}h {}m", hours, minutes));
            } else {
                parts.push(format!("Uptime: {}m", minutes));
            }
        }
        if let Some(errors) = &self.errors {
            parts.push(format!("Errors: {}", errors));
        }
        if let Some(queue) = &self.queue_len {
            parts.push(format!("Queue: {}", queue));
        }

        (!parts.is_empty()).then(|| format!("[DEVICE] {}", parts.join(" | ")))
    }
}

/// Online or offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Bridge running
    Online,
    /// Bridge stopping, also the last-will value
    Offline,
}

impl Presence {
    /// Wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
        }
    }
}

/// Heartbeat contents, rebuilt on every tick
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Online or offline
    pub presence: Presence,
    /// Capture time
    pub timestamp: DateTime<Local>,
    /// Time since the bridge started
    pub uptime: Duration,
    /// Arrival of the most recent packet
    pub last_packet_at: Option<DateTime<Local>>,
    /// Serial transport state
    pub serial_state: ConnectionState,
    /// Broker transport state
    pub broker_state: ConnectionState,
    /// Counter values
    pub counters: CounterSnapshot,
    /// Latest statistics reported by the device
    pub device: Option<DeviceStats>,
}

impl StatusSnapshot {
    /// Build a snapshot from live counters and transport states
    pub fn capture(
        presence: Presence,
        uptime: Duration,
        counters: &BridgeCounters,
        serial_state: ConnectionState,
        broker_state: ConnectionState,
        device: Option<DeviceStats>,
    ) -> Self {
        Self {
            presence,
            timestamp: Local::now(),
            uptime,
            last_packet_at: counters.last_packet_at(),
            serial_state,
            broker_state,
            counters: counters.snapshot(),
            device,
        }
    }

    /// One-line service summary for the log
    pub fn service_log_line(&self) -> String {
        let c = &self.counters;
        format!(
            "[SERVICE] uptime={} rx={} tx={} bytes={} queued={} published={} dropped={} \
             serial={} broker={} reconnects={}/{} failures={} framing_errors={}",
            humantime::format_duration(Duration::from_secs(self.uptime.as_secs())),
            c.packets_rx,
            c.packets_tx,
            c.bytes_received,
            c.packets_queued,
            c.packets_published,
            c.packets_dropped,
            self.serial_state,
            self.broker_state,
            c.serial_reconnects,
            c.broker_reconnects,
            c.publish_failures,
            c.framing_errors,
        )
    }
}
