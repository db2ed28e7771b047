//! Topic and payload mapping
//!
//! Turns decoded packets and status snapshots into [`PublishAttempt`]s.
//! Topics depend only on the observer identity and the templates, so they
//! are rendered once; payloads are JSON documents compatible with the
//! deployed `mctomqtt` message contract, plus a few additive fields.

use crate::classifier::DecodedPacket;
use crate::codec::Direction;
use crate::config::{BrokerConfig, Qos, TopicConfig};
use crate::error::Result;
use crate::identity::{client_version, ObserverIdentity, UNKNOWN};
use crate::status::{CounterSnapshot, DeviceStats, Presence, StatusSnapshot};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;

/// What a publish carries; drives queue policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Mesh packet event
    Packet,
    /// Status heartbeat
    Status,
}

/// One message ready for the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    /// Destination topic
    pub topic: String,
    /// Encoded payload
    pub payload: Bytes,
    /// Delivery QoS
    pub qos: Qos,
    /// Retain flag
    pub retain: bool,
    /// Packet or status
    pub class: MessageClass,
}

/// Render a topic template
///
/// `{region}` and `{IATA}` become the region code, `{publicKey}` and
/// `{PUBLIC_KEY}` the observer key. Other text passes through unchanged.
pub fn render_topic(template: &str, region: &str, public_key: &str) -> String {
    template
        .replace("{region}", region)
        .replace("{IATA}", region)
        .replace("{publicKey}", public_key)
        .replace("{PUBLIC_KEY}", public_key)
}

#[derive(Serialize)]
struct PacketMessage<'a> {
    origin: &'a str,
    origin_id: &'a str,
    timestamp: String,
    #[serde(rename = "type")]
    message_type: &'static str,
    direction: &'static str,
    time: &'a str,
    date: &'a str,
    len: String,
    packet_type: String,
    route: &'a str,
    payload_len: String,
    raw: Option<String>,
    #[serde(rename = "SNR", skip_serializing_if = "Option::is_none")]
    snr: Option<String>,
    #[serde(rename = "RSSI", skip_serializing_if = "Option::is_none")]
    rssi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_hash: Option<String>,
}

#[derive(Serialize)]
struct StatusMessage<'a> {
    status: &'static str,
    timestamp: String,
    origin: &'a str,
    origin_id: &'a str,
    radio: &'a str,
    model: &'a str,
    firmware_version: &'a str,
    client_version: String,
    uptime_secs: u64,
    last_packet_at: Option<String>,
    serial_state: String,
    broker_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a DeviceStats>,
    bridge_stats: &'a CounterSnapshot,
}

#[derive(Serialize)]
struct DebugMessage<'a> {
    origin: &'a str,
    origin_id: &'a str,
    timestamp: String,
    #[serde(rename = "type")]
    message_type: &'static str,
    message: &'a str,
}

/// Python-style `isoformat()` of a local time, without offset
fn isoformat(time: &DateTime<Local>) -> String {
    time.naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Maps packets and statuses onto topics and payloads
#[derive(Debug, Clone)]
pub struct PayloadMapper {
    identity: Arc<ObserverIdentity>,
    packets_topic: String,
    status_topic: String,
    debug_topic: Option<String>,
    qos: Qos,
    packets_retain: bool,
    status_retain: bool,
}

impl PayloadMapper {
    /// Create a mapper, rendering both topics up front
    pub fn new(identity: Arc<ObserverIdentity>, topics: &TopicConfig, broker: &BrokerConfig) -> Self {
        let packets_topic = render_topic(&topics.packets, &identity.region, &identity.public_key);
        let status_topic = render_topic(&topics.status, &identity.region, &identity.public_key);
        let debug_topic = topics
            .debug
            .as_deref()
            .map(|template| render_topic(template, &identity.region, &identity.public_key));
        Self {
            identity,
            packets_topic,
            status_topic,
            debug_topic,
            qos: broker.qos,
            packets_retain: broker.packets_retain,
            status_retain: broker.status_retain,
        }
    }

    /// Rendered packets topic
    pub fn packets_topic(&self) -> &str {
        &self.packets_topic
    }

    /// Rendered status topic
    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    /// Rendered debug topic, if one is configured
    pub fn debug_topic(&self) -> Option<&str> {
        self.debug_topic.as_deref()
    }

    /// Observer identity used in payloads
    pub fn identity(&self) -> &ObserverIdentity {
        &self.identity
    }

    /// Build the attempt for a decoded packet
    pub fn packet(&self, packet: &DecodedPacket) -> Result<PublishAttempt> {
        let summary = &packet.summary;
        let rx = summary.direction == Direction::Rx;
        let message = PacketMessage {
            origin: self.identity.origin(),
            origin_id: &self.identity.public_key,
            timestamp: isoformat(&packet.received_at.wall),
            message_type: "PACKET",
            direction: summary.direction.as_str(),
            time: &summary.time,
            date: &summary.date,
            len: summary.len.to_string(),
            packet_type: summary.packet_type.to_string(),
            route: &summary.route,
            payload_len: summary.payload_len.to_string(),
            raw: (!packet.raw.is_empty()).then(|| hex::encode_upper(&packet.raw)),
            snr: summary.snr.filter(|_| rx).map(|v| v.to_string()),
            rssi: summary.rssi.filter(|_| rx).map(|v| v.to_string()),
            score: summary.score.filter(|_| rx).map(|v| v.to_string()),
            duration: summary.duration.filter(|_| rx).map(|v| v.to_string()),
            hash: summary.hash.as_deref().filter(|_| rx),
            path: summary
                .path
                .as_deref()
                .filter(|_| rx && summary.route == "D"),
            kind: packet.kind.as_str(),
            source_public_key: packet.source_public_key.map(|k| k.to_hex()),
            source_hash: packet.source_hash.map(|h| format!("{:02X}", h)),
        };

        Ok(PublishAttempt {
            topic: self.packets_topic.clone(),
            payload: Bytes::from(serde_json::to_vec(&message)?),
            qos: self.qos,
            retain: self.packets_retain,
            class: MessageClass::Packet,
        })
    }

    /// Build the attempt for a status snapshot
    pub fn status(&self, status: &StatusSnapshot) -> Result<PublishAttempt> {
        let identity = &self.identity;
        let message = StatusMessage {
            status: status.presence.as_str(),
            timestamp: isoformat(&status.timestamp),
            origin: identity.origin(),
            origin_id: &identity.public_key,
            radio: identity.radio.as_deref().unwrap_or(UNKNOWN),
            model: identity.model.as_deref().unwrap_or(UNKNOWN),
            firmware_version: identity.firmware_version.as_deref().unwrap_or(UNKNOWN),
            client_version: client_version(),
            uptime_secs: status.uptime.as_secs(),
            last_packet_at: status.last_packet_at.as_ref().map(isoformat),
            serial_state: status.serial_state.to_string(),
            broker_state: status.broker_state.to_string(),
            stats: status.device.as_ref().filter(|stats| !stats.is_empty()),
            bridge_stats: &status.counters,
        };

        Ok(PublishAttempt {
            topic: self.status_topic.clone(),
            payload: Bytes::from(serde_json::to_vec(&message)?),
            qos: self.qos,
            retain: self.status_retain,
            class: MessageClass::Status,
        })
    }

    /// Build the attempt for a firmware `DEBUG` line
    ///
    /// `None` when no debug topic is configured. Debug lines share the
    /// packet queue policy and are never retained.
    pub fn debug(&self, line: &str, at: &DateTime<Local>) -> Result<Option<PublishAttempt>> {
        let Some(topic) = &self.debug_topic else {
            return Ok(None);
        };
        let message = DebugMessage {
            origin: self.identity.origin(),
            origin_id: &self.identity.public_key,
            timestamp: isoformat(at),
            message_type: "DEBUG",
            message: line,
        };
        Ok(Some(PublishAttempt {
            topic: topic.clone(),
            payload: Bytes::from(serde_json::to_vec(&message)?),
            qos: self.qos,
            retain: false,
            class: MessageClass::Packet,
        }))
    }

    /// Retained offline status registered as the last will
    pub fn last_will(&self) -> Result<PublishAttempt> {
        #[derive(Serialize)]
        struct Will<'a> {
            status: &'static str,
            origin: &'a str,
            origin_id: &'a str,
            client_version: String,
        }
        let will = Will {
            status: Presence::Offline.as_str(),
            origin: self.identity.origin(),
            origin_id: &self.identity.public_key,
            client_version: client_version(),
        };
        Ok(PublishAttempt {
            topic: self.status_topic.clone(),
            payload: Bytes::from(serde_json::to_vec(&will)?),
            qos: self.qos,
            retain: true,
            class: MessageClass::Status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, ReceivedAt};
    use crate::codec::{PacketSummary, RawFrame};
    use crate::config::BridgeConfig;
    use crate::interface::ConnectionState;
    use crate::status::BridgeCounters;
    use serde_json::Value;
    use std::time::Duration;

    fn mapper(template: &str) -> PayloadMapper {
        let identity = Arc::new(
            ObserverIdentity::new("ABCD1234", "ITA")
                .unwrap()
                .with_name("Hilltop"),
        );
        let mut config = BridgeConfig::default();
        config.topics.packets = template.to_string();
        PayloadMapper::new(identity, &config.topics, &config.broker)
    }

    fn rx_packet(route: &str, raw: Vec<u8>) -> DecodedPacket {
        classify(
            RawFrame {
                summary: PacketSummary {
                    direction: Direction::Rx,
                    time: "12:34:56".into(),
                    date: "1/2/2025".into(),
                    len: raw.len(),
                    packet_type: 2,
                    route: route.into(),
                    payload_len: raw.len().saturating_sub(2),
                    snr: Some(-4.5),
                    rssi: Some(-98),
                    score: Some(700),
                    duration: None,
                    hash: Some("5A3C".into()),
                    path: Some("3F -> 7A".into()),
                },
                raw: Bytes::from(raw),
            },
            ReceivedAt::now(),
        )
    }

    #[test]
    fn test_render_topic() {
        assert_eq!(
            render_topic("meshcore/{region}/{publicKey}/packets", "ITA", "ABCD1234"),
            "meshcore/ITA/ABCD1234/packets"
        );
        assert_eq!(
            render_topic("meshcore/{IATA}/{PUBLIC_KEY}/status", "SEA", "FF"),
            "meshcore/SEA/FF/status"
        );
        assert_eq!(render_topic("fixed/topic", "ITA", "FF"), "fixed/topic");
    }

    #[test]
    fn test_topic_independent_of_payload() {
        let mapper = mapper("meshcore/{region}/{publicKey}/packets");
        let a = mapper.packet(&rx_packet("F", vec![0x09, 0x00, 1, 2])).unwrap();
        let b = mapper.packet(&rx_packet("D", vec![0x0A, 0x00, 7, 7, 7])).unwrap();
        assert_eq!(a.topic, "meshcore/ITA/ABCD1234/packets");
        assert_eq!(a.topic, b.topic);
        assert_ne!(a.payload, b.payload);
    }

    #[test]
    fn test_packet_payload_fields() {
        let mapper = mapper("t/{region}");
        let attempt = mapper
            .packet(&rx_packet("D", vec![0x0A, 0x00, 0x10, 0x20]))
            .unwrap();
        assert_eq!(attempt.class, MessageClass::Packet);
        assert_eq!(attempt.qos, Qos::AtMostOnce);
        assert!(!attempt.retain);

        let json: Value = serde_json::from_slice(&attempt.payload).unwrap();
        assert_eq!(json["origin"], "Hilltop");
        assert_eq!(json["origin_id"], "ABCD1234");
        assert_eq!(json["type"], "PACKET");
        assert_eq!(json["direction"], "rx");
        assert_eq!(json["len"], "4");
        assert_eq!(json["packet_type"], "2");
        assert_eq!(json["raw"], "0A001020");
        assert_eq!(json["SNR"], "-4.5");
        assert_eq!(json["RSSI"], "-98");
        assert_eq!(json["score"], "700");
        assert_eq!(json["hash"], "5A3C");
        assert_eq!(json["path"], "3F -> 7A");
        assert_eq!(json["kind"], "telemetry");
        assert_eq!(json["source_hash"], "20");
        assert!(json.get("duration").is_none());
    }

    #[test]
    fn test_path_only_for_direct_route() {
        let mapper = mapper("t");
        let attempt = mapper.packet(&rx_packet("F", vec![0x09, 0x00, 1, 2])).unwrap();
        let json: Value = serde_json::from_slice(&attempt.payload).unwrap();
        assert!(json.get("path").is_none());
    }

    #[test]
    fn test_status_payload() {
        let mapper = mapper("t");
        let counters = BridgeCounters::new();
        let snapshot = StatusSnapshot::capture(
            Presence::Online,
            Duration::from_secs(42),
            &counters,
            ConnectionState::Connected,
            ConnectionState::Connecting,
            None,
        );
        let attempt = mapper.status(&snapshot).unwrap();
        assert_eq!(attempt.topic, "meshcore/ITA/ABCD1234/status");
        assert_eq!(attempt.class, MessageClass::Status);
        assert!(attempt.retain);

        let json: Value = serde_json::from_slice(&attempt.payload).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["uptime_secs"], 42);
        assert_eq!(json["model"], "unknown");
        assert_eq!(json["serial_state"], "connected");
        assert_eq!(json["broker_state"], "connecting");
        assert_eq!(json["bridge_stats"]["packets_rx"], 0);
        assert!(json.get("stats").is_none());
        assert!(json["client_version"]
            .as_str()
            .unwrap()
            .starts_with("meshcore-bridge/"));
    }

    #[test]
    fn test_status_payload_carries_device_stats() {
        let device: DeviceStats =
            serde_json::from_str(r#"{"battery_mv":4120,"uptime_secs":600,"noise_floor":-112}"#)
                .unwrap();
        let snapshot = StatusSnapshot::capture(
            Presence::Online,
            Duration::from_secs(42),
            &BridgeCounters::new(),
            ConnectionState::Connected,
            ConnectionState::Connected,
            Some(device),
        );
        let attempt = mapper("t").status(&snapshot).unwrap();

        let json: Value = serde_json::from_slice(&attempt.payload).unwrap();
        assert_eq!(json["stats"]["battery_mv"], 4120);
        assert_eq!(json["stats"]["noise_floor"], -112);
        assert!(json["stats"].get("errors").is_none());
        assert_eq!(json["bridge_stats"]["packets_published"], 0);
    }

    #[test]
    fn test_debug_message() {
        let at = Local::now();
        assert!(mapper("t").debug("DEBUG: x", &at).unwrap().is_none());

        let identity = Arc::new(ObserverIdentity::new("ABCD1234", "ITA").unwrap());
        let mut config = BridgeConfig::default();
        config.topics.debug = Some("meshcore/{IATA}/{PUBLIC_KEY}/debug".into());
        let mapper = PayloadMapper::new(identity, &config.topics, &config.broker);
        assert_eq!(mapper.debug_topic(), Some("meshcore/ITA/ABCD1234/debug"));

        let attempt = mapper.debug("DEBUG: radio reset", &at).unwrap().unwrap();
        assert_eq!(attempt.class, MessageClass::Packet);
        assert!(!attempt.retain);
        let json: Value = serde_json::from_slice(&attempt.payload).unwrap();
        assert_eq!(json["type"], "DEBUG");
        assert_eq!(json["message"], "DEBUG: radio reset");
        assert_eq!(json["origin_id"], "ABCD1234");
    }

    #[test]
    fn test_last_will_is_retained_offline() {
        let will = mapper("t").last_will().unwrap();
        assert!(will.retain);
        let json: Value = serde_json::from_slice(&will.payload).unwrap();
        assert_eq!(json["status"], "offline");
    }
}
