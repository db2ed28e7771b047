//! Packet classification
//!
//! Inspects the MeshCore packet header of a [`RawFrame`] and sorts it into
//! a closed set of kinds. Classification is pure and total: structural
//! problems never surface as errors, the packet is forwarded as
//! [`PacketKind::Unknown`] with its full raw bytes instead.
//!
//! # Wire layout
//!
//! | Field | Size | Notes |
//! |-------|------|-------|
//! | header | 1 | route type bits 0-1, payload type bits 2-5, version bits 6-7 |
//! | transport codes | 4 | only for transport-flood and transport-direct routes |
//! | path_len | 1 | |
//! | path | path_len | one hash byte per hop |
//! | payload | rest | |

use crate::codec::{PacketSummary, RawFrame};
use bytes::Bytes;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::time::Instant;
use tracing::trace;

/// Length of an Ed25519 public key
pub const PUB_KEY_SIZE: usize = 32;

/// Advert payload: public key, timestamp, signature, then app data
const ADVERT_MIN_LEN: usize = PUB_KEY_SIZE + 4 + 64;

/// Only payload version understood by this classifier
const PAYLOAD_VERSION_1: u8 = 0;

/// Route type from header bits 0-1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    /// Flood with transport codes
    TransportFlood,
    /// Flood
    Flood,
    /// Direct along a supplied path
    Direct,
    /// Direct with transport codes
    TransportDirect,
}

impl RouteType {
    fn from_header(header: u8) -> Self {
        match header & 0x03 {
            0 => RouteType::TransportFlood,
            1 => RouteType::Flood,
            2 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    /// Whether 4 bytes of transport codes follow the header
    pub fn has_transport_codes(&self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::TransportDirect)
    }
}

/// Payload type from header bits 2-5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Request
    Req,
    /// Response to a request or anonymous request
    Response,
    /// Plain text message
    TxtMsg,
    /// Acknowledgement
    Ack,
    /// Node advertisement
    Advert,
    /// Group text message
    GrpTxt,
    /// Group datagram
    GrpData,
    /// Request from a sender not yet known to the destination
    AnonReq,
    /// Returned path
    Path,
    /// Path trace
    Trace,
    /// Multi-part packet
    Multipart,
    /// Anything else, including custom raw payloads
    Other(u8),
}

impl From<u8> for PayloadType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Req,
            0x01 => Self::Response,
            0x02 => Self::TxtMsg,
            0x03 => Self::Ack,
            0x04 => Self::Advert,
            0x05 => Self::GrpTxt,
            0x06 => Self::GrpData,
            0x07 => Self::AnonReq,
            0x08 => Self::Path,
            0x09 => Self::Trace,
            0x0A => Self::Multipart,
            other => Self::Other(other),
        }
    }
}

/// Decoded header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Route type
    pub route: RouteType,
    /// Payload type
    pub payload_type: PayloadType,
    /// Payload version
    pub version: u8,
}

impl PacketHeader {
    /// Split a header byte into its fields
    pub fn parse(byte: u8) -> Self {
        Self {
            route: RouteType::from_header(byte),
            payload_type: PayloadType::from((byte >> 2) & 0x0F),
            version: byte >> 6,
        }
    }
}

/// Kind of packet as far as the aggregation service is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Node presence announcement
    Advertisement,
    /// Route or hop trace
    Path,
    /// Data-bearing packet
    Telemetry,
    /// Not structurally parsed
    Unknown,
}

impl PacketKind {
    /// Lower-case name used in payloads and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Advertisement => "advertisement",
            PacketKind::Path => "path",
            PacketKind::Telemetry => "telemetry",
            PacketKind::Unknown => "unknown",
        }
    }

    fn for_payload(payload_type: PayloadType) -> Self {
        match payload_type {
            PayloadType::Advert => PacketKind::Advertisement,
            PayloadType::Path | PayloadType::Trace => PacketKind::Path,
            PayloadType::Req
            | PayloadType::Response
            | PayloadType::TxtMsg
            | PayloadType::Ack
            | PayloadType::GrpTxt
            | PayloadType::GrpData
            | PayloadType::AnonReq
            | PayloadType::Multipart => PacketKind::Telemetry,
            PayloadType::Other(_) => PacketKind::Unknown,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 32-byte node public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUB_KEY_SIZE]);

impl PublicKey {
    /// Copy a key out of a slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(PublicKey)
    }

    /// Upper-case hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..8])
    }
}

/// Arrival time of a frame, monotonic and wall clock
#[derive(Debug, Clone, Copy)]
pub struct ReceivedAt {
    /// Monotonic instant, for ordering and latency
    pub instant: Instant,
    /// Local wall-clock time, for payloads
    pub wall: DateTime<Local>,
}

impl ReceivedAt {
    /// Capture the current time
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Local::now(),
        }
    }
}

/// A frame after classification
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    /// Packet kind
    pub kind: PacketKind,
    /// Public key carried by adverts and anonymous requests
    pub source_public_key: Option<PublicKey>,
    /// One-byte source hash of hash-addressed packets
    pub source_hash: Option<u8>,
    /// Payload after header and path; the whole frame for `Unknown`
    pub payload_bytes: Bytes,
    /// Complete frame bytes
    pub raw: Bytes,
    /// Firmware summary
    pub summary: PacketSummary,
    /// Route type, when the header could be read
    pub route: Option<RouteType>,
    /// Arrival time
    pub received_at: ReceivedAt,
}

/// Classify a frame
pub fn classify(frame: RawFrame, received_at: ReceivedAt) -> DecodedPacket {
    let RawFrame { raw, summary } = frame;

    if raw.is_empty() {
        // no bytes to inspect, trust the firmware's type field
        let kind = PacketKind::for_payload(PayloadType::from(summary.packet_type));
        return DecodedPacket {
            kind,
            source_public_key: None,
            source_hash: None,
            payload_bytes: Bytes::new(),
            raw,
            summary,
            route: None,
            received_at,
        };
    }

    match inspect(&raw) {
        Some(parsed) => DecodedPacket {
            kind: parsed.kind,
            source_public_key: parsed.source_public_key,
            source_hash: parsed.source_hash,
            payload_bytes: parsed.payload,
            raw,
            summary,
            route: Some(parsed.route),
            received_at,
        },
        None => {
            trace!(len = raw.len(), "Packet not structurally parsed");
            let route = Some(RouteType::from_header(raw[0]));
            DecodedPacket {
                kind: PacketKind::Unknown,
                source_public_key: None,
                source_hash: None,
                payload_bytes: raw.clone(),
                raw,
                summary,
                route,
                received_at,
            }
        }
    }
}

struct Inspected {
    kind: PacketKind,
    route: RouteType,
    payload: Bytes,
    source_public_key: Option<PublicKey>,
    source_hash: Option<u8>,
}

/// Structural parse; `None` means fall back to `Unknown`
fn inspect(raw: &Bytes) -> Option<Inspected> {
    let header = PacketHeader::parse(*raw.first()?);
    if header.version != PAYLOAD_VERSION_1 {
        return None;
    }

    let mut offset = 1;
    if header.route.has_transport_codes() {
        offset += 4;
    }
    let path_len = *raw.get(offset)? as usize;
    offset += 1;
    if offset + path_len > raw.len() {
        return None;
    }
    let payload = raw.slice(offset + path_len..);

    let kind = PacketKind::for_payload(header.payload_type);
    let mut source_public_key = None;
    let mut source_hash = None;

    match header.payload_type {
        PayloadType::Advert => {
            if payload.len() < ADVERT_MIN_LEN {
                return None;
            }
            source_public_key = PublicKey::from_slice(&payload[..PUB_KEY_SIZE]);
        }
        PayloadType::AnonReq => {
            source_public_key = Some(PublicKey::from_slice(payload.get(1..1 + PUB_KEY_SIZE)?)?);
        }
        PayloadType::Req | PayloadType::Response | PayloadType::TxtMsg | PayloadType::Path => {
            source_hash = Some(*payload.get(1)?);
        }
        PayloadType::Other(_) => return None,
        _ => {}
    }

    Some(Inspected {
        kind,
        route: header.route,
        payload,
        source_public_key,
        source_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Direction;
    use crate::test_utils::advert_packet;
    use proptest::prelude::*;

    fn summary(len: usize, packet_type: u8) -> PacketSummary {
        PacketSummary {
            direction: Direction::Rx,
            time: "12:00:00".into(),
            date: "1/1/2025".into(),
            len,
            packet_type,
            route: "F".into(),
            payload_len: 0,
            snr: None,
            rssi: None,
            score: None,
            duration: None,
            hash: None,
            path: None,
        }
    }

    fn frame(raw: Vec<u8>) -> RawFrame {
        let header = raw.first().copied().unwrap_or_default();
        RawFrame {
            summary: summary(raw.len(), (header >> 2) & 0x0F),
            raw: Bytes::from(raw),
        }
    }

    #[test]
    fn test_header_fields() {
        let header = PacketHeader::parse(0b01_0100_10);
        assert_eq!(header.route, RouteType::Direct);
        assert_eq!(header.payload_type, PayloadType::Advert);
        assert_eq!(header.version, 1);
    }

    #[test]
    fn test_advert_extracts_public_key() {
        let key = [0xAB; 32];
        let packet = classify(frame(advert_packet(key)), ReceivedAt::now());
        assert_eq!(packet.kind, PacketKind::Advertisement);
        assert_eq!(packet.source_public_key, Some(PublicKey(key)));
        assert_eq!(packet.route, Some(RouteType::Flood));
        assert_eq!(&packet.payload_bytes[..32], &key);
    }

    #[test]
    fn test_short_advert_is_unknown() {
        let mut raw = advert_packet([0xAB; 32]);
        raw.truncate(40);
        let packet = classify(frame(raw.clone()), ReceivedAt::now());
        assert_eq!(packet.kind, PacketKind::Unknown);
        assert_eq!(packet.payload_bytes.as_ref(), raw.as_slice());
    }

    #[test]
    fn test_transport_codes_skipped() {
        // transport-flood TXT_MSG: 4 transport bytes, 2-hop path, dest 0x10, src 0x20
        let raw = vec![0x02 << 2, 1, 2, 3, 4, 2, 0xAA, 0xBB, 0x10, 0x20, 0xFF];
        let packet = classify(frame(raw), ReceivedAt::now());
        assert_eq!(packet.kind, PacketKind::Telemetry);
        assert_eq!(packet.source_hash, Some(0x20));
        assert_eq!(packet.payload_bytes.as_ref(), &[0x10, 0x20, 0xFF]);
    }

    #[test]
    fn test_path_packet() {
        let raw = vec![(0x08 << 2) | 0x02, 0x01, 0x7A, 0x33, 0x44, 0x00];
        let packet = classify(frame(raw), ReceivedAt::now());
        assert_eq!(packet.kind, PacketKind::Path);
        assert_eq!(packet.source_hash, Some(0x44));
    }

    #[test]
    fn test_anon_req_sender_key() {
        let mut raw = vec![(0x07 << 2) | 0x01, 0x00, 0x99];
        raw.extend_from_slice(&[0x5C; 32]);
        raw.extend_from_slice(&[0u8; 8]);
        let packet = classify(frame(raw), ReceivedAt::now());
        assert_eq!(packet.kind, PacketKind::Telemetry);
        assert_eq!(packet.source_public_key, Some(PublicKey([0x5C; 32])));
    }

    #[test]
    fn test_path_overrun_is_unknown() {
        let raw = vec![(0x02 << 2) | 0x01, 0x09, 0x01];
        let packet = classify(frame(raw), ReceivedAt::now());
        assert_eq!(packet.kind, PacketKind::Unknown);
    }

    #[test]
    fn test_missing_raw_uses_summary_type() {
        let packet = classify(
            RawFrame {
                raw: Bytes::new(),
                summary: summary(20, 4),
            },
            ReceivedAt::now(),
        );
        assert_eq!(packet.kind, PacketKind::Advertisement);
        assert!(packet.source_public_key.is_none());
    }

    proptest! {
        #[test]
        fn prop_unrecognized_type_is_unknown_with_full_payload(
            payload_type in 0x0Bu8..=0x0F,
            route in 0u8..4,
            body in proptest::collection::vec(any::<u8>(), 0..200),
        ) {
            let mut raw = vec![(payload_type << 2) | route];
            raw.extend_from_slice(&body);
            let packet = classify(frame(raw.clone()), ReceivedAt::now());
            prop_assert_eq!(packet.kind, PacketKind::Unknown);
            prop_assert_eq!(packet.payload_bytes.as_ref(), raw.as_slice());
            prop_assert_eq!(packet.raw.as_ref(), raw.as_slice());
        }

        #[test]
        fn prop_classify_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..300)) {
            let packet = classify(frame(raw.clone()), ReceivedAt::now());
            prop_assert_eq!(packet.raw.as_ref(), raw.as_slice());
            if packet.kind == PacketKind::Unknown && !raw.is_empty() {
                prop_assert_eq!(packet.payload_bytes.as_ref(), raw.as_slice());
            }
        }
    }
}
