//! Frame decoder for the MeshCore observer serial stream
//!
//! Repeater firmware with packet logging enabled prints one text line per
//! event. A received packet shows up as two lines:
//!
//! ```text
//! 12:34:56 - 1/2/2025 U RAW: 1102A1B2C3...
//! 12:34:56 - 1/2/2025 U: RX, len=42 (type=4, route=F, payload_len=38) SNR=9 RSSI=-71 score=1000 time=123 hash=5A3C...
//! ```
//!
//! The `RAW` line carries the packet bytes, the `RX`/`TX` summary line
//! completes the frame. Boot banners, CLI echo and line noise are skipped.
//!
//! The decoder is a pure state machine: bytes are fed in with
//! [`FrameDecoder::feed`] and frames are pulled out with
//! [`FrameDecoder::decode_next`]. It never blocks; stall handling belongs to
//! the caller, which owns the clock.

use crate::error::FramingError;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, trace, warn};

const RAW_MARKER: &str = "U RAW:";
const RX_MARKER: &str = "U: RX";
const TX_MARKER: &str = "U: TX";
const DEBUG_PREFIX: &str = "DEBUG";

/// Packet direction as seen by the observer radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received over the air
    Rx,
    /// Transmitted by the observer
    Tx,
}

impl Direction {
    /// Lower-case wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Radio summary printed by the firmware for each packet
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSummary {
    /// RX or TX
    pub direction: Direction,
    /// Device clock time, `HH:MM:SS`
    pub time: String,
    /// Device clock date, `D/M/YYYY`
    pub date: String,
    /// Total packet length in bytes
    pub len: usize,
    /// Payload type from the header
    pub packet_type: u8,
    /// Route letter (`F` flood, `D` direct, ...)
    pub route: String,
    /// Payload length in bytes
    pub payload_len: usize,
    /// Signal to noise ratio in dB
    pub snr: Option<f32>,
    /// Received signal strength in dBm
    pub rssi: Option<i32>,
    /// Firmware link score
    pub score: Option<u32>,
    /// Airtime in milliseconds
    pub duration: Option<u32>,
    /// Packet hash as printed by the firmware
    pub hash: Option<String>,
    /// Hop path for direct-routed packets
    pub path: Option<String>,
}

/// One complete unit of the serial wire protocol
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Packet bytes; empty when the firmware printed no `RAW` line
    pub raw: Bytes,
    /// Parsed summary line
    pub summary: PacketSummary,
}

/// Incremental line decoder with bounded buffering
pub struct FrameDecoder {
    /// Bytes of the current, not yet terminated line
    buffer: BytesMut,

    /// Maximum line length before the buffer is dropped
    max_frame_len: usize,

    /// Skipping the tail of an overlong line
    discarding: bool,

    /// Bytes from the last `RAW` line, waiting for their summary
    pending_raw: Option<Bytes>,

    /// Lines skipped since the last [`FrameDecoder::take_ignored`]
    ignored_lines: u64,

    /// Keep firmware `DEBUG` lines instead of skipping them
    capture_debug: bool,

    /// Captured `DEBUG` lines, oldest first
    debug_lines: Vec<String>,
}

impl FrameDecoder {
    /// Create a decoder that rejects lines longer than `max_frame_len`
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_len.min(1024)),
            max_frame_len,
            discarding: false,
            pending_raw: None,
            ignored_lines: 0,
            capture_debug: false,
            debug_lines: Vec::new(),
        }
    }

    /// Keep lines starting with `DEBUG` for [`FrameDecoder::take_debug_lines`]
    pub fn with_debug_lines(mut self, enabled: bool) -> Self {
        self.capture_debug = enabled;
        self
    }

    /// Append bytes read from the device
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from buffered bytes
    ///
    /// Returns `Ok(None)` when more input is needed. An error consumes the
    /// offending line; calling again continues with the following input.
    pub fn decode_next(&mut self) -> Result<Option<RawFrame>, FramingError> {
        loop {
            let newline = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if self.buffer.len() > self.max_frame_len {
                        let len = self.buffer.len();
                        self.buffer.clear();
                        self.pending_raw = None;
                        if self.discarding {
                            return Ok(None);
                        }
                        self.discarding = true;
                        warn!(len, max = self.max_frame_len, "Serial line overflow, resynchronising");
                        return Err(FramingError::FrameOverflow {
                            len,
                            max: self.max_frame_len,
                        });
                    }
                    return Ok(None);
                }
            };

            let line = self.buffer.split_to(newline + 1);

            if self.discarding {
                // tail of an overlong line
                self.discarding = false;
                trace!(discarded = line.len(), "Resynchronised on newline");
                continue;
            }

            if newline > self.max_frame_len {
                self.pending_raw = None;
                return Err(FramingError::FrameOverflow {
                    len: newline,
                    max: self.max_frame_len,
                });
            }

            let text = String::from_utf8_lossy(&line[..newline]);
            let text = text.trim_end_matches('\r');

            if let Some(frame) = self.handle_line(text)? {
                return Ok(Some(frame));
            }
        }
    }

    /// Iterate over every frame currently decodable
    pub fn frames(&mut self) -> impl Iterator<Item = Result<RawFrame, FramingError>> + '_ {
        std::iter::from_fn(move || self.decode_next().transpose())
    }

    /// Whether an unterminated line is buffered
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || self.discarding
    }

    /// Drop a stalled partial line along with any unmatched raw bytes
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.discarding = false;
        self.pending_raw = None;
        dropped
    }

    /// Clear all state; used when the device is reopened
    pub fn reset(&mut self) {
        self.discard_partial();
    }

    /// Return and zero the count of skipped lines
    pub fn take_ignored(&mut self) -> u64 {
        std::mem::take(&mut self.ignored_lines)
    }

    /// Drain captured firmware debug lines
    pub fn take_debug_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.debug_lines)
    }

    fn handle_line(&mut self, line: &str) -> Result<Option<RawFrame>, FramingError> {
        if let Some(idx) = line.find(RAW_MARKER) {
            let hex_text = line[idx + RAW_MARKER.len()..].trim();
            return match hex::decode(hex_text) {
                Ok(bytes) => {
                    trace!(len = bytes.len(), "Raw packet line");
                    self.pending_raw = Some(Bytes::from(bytes));
                    Ok(None)
                }
                Err(e) => {
                    self.pending_raw = None;
                    Err(FramingError::Malformed(format!("invalid raw hex: {}", e)))
                }
            };
        }

        let marker = line.find(RX_MARKER).or_else(|| line.find(TX_MARKER));
        let Some(idx) = marker else {
            if self.capture_debug && line.trim_start().starts_with(DEBUG_PREFIX) {
                self.debug_lines.push(line.trim().to_string());
            } else if !line.trim().is_empty() {
                self.ignored_lines += 1;
                trace!(line, "Ignoring non-packet line");
            }
            return Ok(None);
        };

        // RAW lines belong to received packets; a TX summary leaves them pending
        let raw = if line[idx..].starts_with(RX_MARKER) {
            self.pending_raw.take().unwrap_or_default()
        } else {
            Bytes::new()
        };
        let summary = parse_summary(&line[..idx], &line[idx + 3..])?;

        if !raw.is_empty() && raw.len() != summary.len {
            return Err(FramingError::LengthMismatch {
                announced: summary.len,
                actual: raw.len(),
            });
        }

        debug!(
            direction = %summary.direction,
            len = summary.len,
            packet_type = summary.packet_type,
            route = %summary.route,
            "Decoded frame"
        );
        Ok(Some(RawFrame { raw, summary }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_FRAME_LEN)
    }
}

impl fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("buffer_len", &self.buffer.len())
            .field("max_frame_len", &self.max_frame_len)
            .field("discarding", &self.discarding)
            .field("pending_raw", &self.pending_raw.as_ref().map(|r| r.len()))
            .field("capture_debug", &self.capture_debug)
            .finish()
    }
}

/// Parse the summary line
///
/// `prefix` is everything before the `U: ` marker (device timestamp),
/// `body` starts at `RX`/`TX`.
fn parse_summary(prefix: &str, body: &str) -> Result<PacketSummary, FramingError> {
    let (time, date) = parse_timestamp(prefix);

    let direction = if body.starts_with("RX") {
        Direction::Rx
    } else {
        Direction::Tx
    };
    let mut rest = body[2..].trim();

    let mut path = None;
    if rest.ends_with(']') {
        if let Some(open) = rest.rfind(" [") {
            path = Some(rest[open + 2..rest.len() - 1].to_string());
            rest = &rest[..open];
        }
    }

    let mut len = None;
    let mut packet_type = None;
    let mut route = None;
    let mut payload_len = None;
    let mut summary_snr = None;
    let mut rssi = None;
    let mut score = None;
    let mut duration = None;
    let mut hash = None;

    let tokens = rest
        .split(|c: char| c == ' ' || c == ',' || c == '(' || c == ')')
        .filter(|t| !t.is_empty());
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "len" => len = Some(field(key, value)?),
            "type" => packet_type = Some(field(key, value)?),
            "route" => route = Some(value.to_string()),
            "payload_len" => payload_len = Some(field(key, value)?),
            "SNR" => summary_snr = Some(field(key, value)?),
            "RSSI" => rssi = Some(field(key, value)?),
            "score" => score = Some(field(key, value)?),
            "time" => duration = Some(field(key, value)?),
            "hash" => hash = Some(value.to_string()),
            _ => {}
        }
    }

    let missing = |name: &str| FramingError::Malformed(format!("summary line missing {}", name));
    Ok(PacketSummary {
        direction,
        time,
        date,
        len: len.ok_or_else(|| missing("len"))?,
        packet_type: packet_type.ok_or_else(|| missing("type"))?,
        route: route.ok_or_else(|| missing("route"))?,
        payload_len: payload_len.ok_or_else(|| missing("payload_len"))?,
        snr: summary_snr,
        rssi,
        score,
        duration,
        hash,
        path,
    })
}

fn field<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, FramingError> {
    value
        .parse()
        .map_err(|_| FramingError::Malformed(format!("bad {} value {:?}", key, value)))
}

/// Split `"HH:MM:SS - D/M/YYYY "` into its parts, tolerating leading noise
fn parse_timestamp(prefix: &str) -> (String, String) {
    let prefix = prefix.trim_end();
    match prefix.rsplit_once(" - ") {
        Some((left, date)) => {
            let token = left.rsplit(' ').next().unwrap_or_default();
            let skip = token.chars().count().saturating_sub(8);
            let time: String = token.chars().skip(skip).collect();
            (time, date.trim().to_string())
        }
        None => (String::new(), String::new()),
    }
}
