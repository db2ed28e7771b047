//! Configuration types for the MeshCore bridge
//!
//! Configuration is read once at startup from `MCTOMQTT_*` environment
//! variables (optionally seeded from `.env` / `.env.local` files) and is
//! immutable afterwards. Every component receives the part it needs by
//! value or behind an `Arc`.

use crate::error::{BridgeError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Prefix shared by every environment key this bridge understands
pub const ENV_PREFIX: &str = "MCTOMQTT_";

/// Default baud rate for MeshCore serial devices
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default maximum length of one serial line
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Region code used when none is configured
pub const DEFAULT_REGION: &str = "XXX";

/// Default packets topic template
pub const DEFAULT_PACKETS_TOPIC: &str = "meshcore/{IATA}/{PUBLIC_KEY}/packets";

/// Default status topic template
pub const DEFAULT_STATUS_TOPIC: &str = "meshcore/{IATA}/{PUBLIC_KEY}/status";

/// MQTT quality of service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "u8")]
pub enum Qos {
    /// Fire and forget
    #[default]
    AtMostOnce,
    /// Acknowledged with PUBACK
    AtLeastOnce,
    /// Four-way handshake ending in PUBCOMP
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Main configuration for the bridge
#[derive(Debug, Clone, Serialize)]
pub struct BridgeConfig {
    /// Serial device settings
    pub serial: SerialConfig,

    /// MQTT broker settings
    pub broker: BrokerConfig,

    /// Topic templates
    pub topics: TopicConfig,

    /// Observer identity overrides
    pub observer: ObserverConfig,

    /// Reconnection settings shared by both transports
    pub reconnect: ReconnectConfig,

    /// Maximum number of packets waiting for the broker
    pub queue_capacity: usize,

    /// Period of the status heartbeat
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,

    /// Upper bound on the graceful shutdown flush
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Tracing filter directive
    pub log_level: String,

    /// Publish firmware `DEBUG` lines to the debug topic
    pub debug: bool,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_status_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            broker: BrokerConfig::default(),
            topics: TopicConfig::default(),
            observer: ObserverConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue_capacity: default_queue_capacity(),
            status_interval: default_status_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            log_level: default_log_level(),
            debug: false,
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize)]
pub struct SerialConfig {
    /// Candidate device paths, tried in order
    pub ports: Vec<String>,

    /// Baud rate (default: 115200)
    pub baud_rate: u32,

    /// Silence after which a partial line is discarded
    #[serde(with = "humantime_serde")]
    pub stall_timeout: Duration,

    /// Maximum length of a single line
    pub max_frame_len: usize,
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: vec!["/dev/ttyACM0".to_string()],
            baud_rate: DEFAULT_BAUD_RATE,
            stall_timeout: default_stall_timeout(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Username, if the broker requires authentication
    pub username: Option<String>,
    /// Password paired with `username`
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Prefix of the generated client id
    pub client_id_prefix: String,
    /// MQTT keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Connect over TLS using the platform roots
    pub use_tls: bool,
    /// QoS used for every publish
    pub qos: Qos,
    /// Retain flag for status messages
    pub status_retain: bool,
    /// Retain flag for packet messages
    pub packets_retain: bool,
    /// How long to wait for CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long to wait for a publish to complete
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "meshcore_".to_string(),
            keep_alive: Duration::from_secs(60),
            use_tls: false,
            qos: Qos::AtMostOnce,
            status_retain: true,
            packets_retain: false,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Topic templates
///
/// Placeholders: `{region}` / `{IATA}` and `{publicKey}` / `{PUBLIC_KEY}`.
#[derive(Debug, Clone, Serialize)]
pub struct TopicConfig {
    /// Template for packet messages
    pub packets: String,
    /// Template for status messages
    pub status: String,
    /// Template for firmware debug lines; nothing is published without it
    pub debug: Option<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            packets: DEFAULT_PACKETS_TOPIC.to_string(),
            status: DEFAULT_STATUS_TOPIC.to_string(),
            debug: None,
        }
    }
}

/// Observer identity configuration
///
/// Values left unset are read from the device CLI at startup.
#[derive(Debug, Clone, Serialize)]
pub struct ObserverConfig {
    /// Region code (IATA airport code by convention)
    pub region: String,
    /// Observer public key as hex
    pub public_key: Option<String>,
    /// Observer display name
    pub origin: Option<String>,
    /// Push the host clock to the device at startup (default: on)
    pub sync_time: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            public_key: None,
            origin: None,
            sync_time: true,
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectConfig {
    /// First delay after a failure
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,

    /// Maximum delay between attempts
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied after each failed attempt
    pub multiplier: f64,

    /// Connection lifetime after which the delay resets to `min_delay`
    #[serde(with = "humantime_serde")]
    pub stable_period: Duration,
}

fn default_min_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_stable_period() -> Duration {
    Duration::from_secs(120)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            stable_period: default_stable_period(),
        }
    }
}

impl BridgeConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build the configuration from `(key, value)` pairs
    ///
    /// Keys without the `MCTOMQTT_` prefix are ignored. Keys of features
    /// this bridge does not carry (extra brokers, websocket transport, token
    /// auth) are logged and skipped; any other unrecognised prefixed key is
    /// rejected so that typos do not go unnoticed.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut env: BTreeMap<String, String> = vars
            .into_iter()
            .filter_map(|(k, v)| {
                k.as_ref()
                    .strip_prefix(ENV_PREFIX)
                    .map(|key| (key.to_string(), v.as_ref().trim().to_string()))
            })
            .collect();

        let mut config = BridgeConfig::default();

        let ports = take(&mut env, "SERIAL_PORTS")
            .ok_or_else(|| BridgeError::MissingConfig(format!("{}SERIAL_PORTS", ENV_PREFIX)))?;
        config.serial.ports = ports
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if let Some(v) = take(&mut env, "SERIAL_BAUD_RATE") {
            config.serial.baud_rate = parse_num("SERIAL_BAUD_RATE", &v)?;
        }
        if let Some(v) = take(&mut env, "SERIAL_TIMEOUT") {
            config.serial.stall_timeout = parse_duration("SERIAL_TIMEOUT", &v)?;
        }
        if let Some(v) = take(&mut env, "MAX_FRAME_LEN") {
            config.serial.max_frame_len = parse_num("MAX_FRAME_LEN", &v)?;
        }

        if let Some(v) = take(&mut env, "IATA") {
            config.observer.region = v;
        }
        config.observer.public_key = take(&mut env, "PUBLIC_KEY");
        config.observer.origin = take(&mut env, "ORIGIN");
        if let Some(v) = take(&mut env, "SYNC_TIME") {
            config.observer.sync_time = parse_bool("SYNC_TIME", &v)?;
        }

        if let Some(v) = take(&mut env, "MQTT1_ENABLED") {
            if !parse_bool("MQTT1_ENABLED", &v)? {
                return Err(invalid(
                    "MQTT1_ENABLED=false leaves no broker to publish to",
                ));
            }
        }
        if let Some(v) = take(&mut env, "MQTT1_IATA") {
            config.observer.region = v;
        }
        if let Some(v) = take(&mut env, "MQTT1_SERVER") {
            config.broker.host = v;
        }
        if let Some(v) = take(&mut env, "MQTT1_PORT") {
            config.broker.port = parse_num("MQTT1_PORT", &v)?;
        }
        config.broker.username = take(&mut env, "MQTT1_USERNAME");
        config.broker.password = take(&mut env, "MQTT1_PASSWORD");
        if let Some(v) = take(&mut env, "MQTT1_CLIENT_ID_PREFIX") {
            config.broker.client_id_prefix = v;
        }
        if let Some(v) = take(&mut env, "MQTT1_KEEPALIVE") {
            config.broker.keep_alive = parse_duration("MQTT1_KEEPALIVE", &v)?;
        }
        if let Some(v) = take(&mut env, "MQTT1_USE_TLS") {
            config.broker.use_tls = parse_bool("MQTT1_USE_TLS", &v)?;
        }
        if let Some(v) = take(&mut env, "MQTT1_QOS") {
            let level: u8 = parse_num("MQTT1_QOS", &v)?;
            config.broker.qos = Qos::try_from(level)
                .map_err(|e| BridgeError::InvalidConfig(format!("MQTT1_QOS: {}", e)))?;
        }
        if let Some(v) = take(&mut env, "MQTT1_RETAIN") {
            config.broker.status_retain = parse_bool("MQTT1_RETAIN", &v)?;
        }
        if let Some(v) = take(&mut env, "MQTT1_PACKETS_RETAIN") {
            config.broker.packets_retain = parse_bool("MQTT1_PACKETS_RETAIN", &v)?;
        }
        if let Some(v) = take(&mut env, "MQTT1_CONNECT_TIMEOUT") {
            config.broker.connect_timeout = parse_duration("MQTT1_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = take(&mut env, "MQTT1_ACK_TIMEOUT") {
            config.broker.ack_timeout = parse_duration("MQTT1_ACK_TIMEOUT", &v)?;
        }

        if let Some(v) = take(&mut env, "TOPIC_PACKETS") {
            config.topics.packets = v;
        }
        if let Some(v) = take(&mut env, "TOPIC_STATUS") {
            config.topics.status = v;
        }
        if let Some(v) = take(&mut env, "TOPIC_DEBUG") {
            config.topics.debug = Some(v);
        }
        if let Some(v) = take(&mut env, "MQTT1_TOPIC_PACKETS") {
            config.topics.packets = v;
        }
        if let Some(v) = take(&mut env, "MQTT1_TOPIC_STATUS") {
            config.topics.status = v;
        }
        if let Some(v) = take(&mut env, "MQTT1_TOPIC_DEBUG") {
            config.topics.debug = Some(v);
        }

        if let Some(v) = take(&mut env, "RECONNECT_MIN_DELAY") {
            config.reconnect.min_delay = parse_duration("RECONNECT_MIN_DELAY", &v)?;
        }
        if let Some(v) = take(&mut env, "RECONNECT_MAX_DELAY") {
            config.reconnect.max_delay = parse_duration("RECONNECT_MAX_DELAY", &v)?;
        }
        if let Some(v) = take(&mut env, "RECONNECT_MULTIPLIER") {
            config.reconnect.multiplier = parse_num("RECONNECT_MULTIPLIER", &v)?;
        }
        if let Some(v) = take(&mut env, "RECONNECT_STABLE_PERIOD") {
            config.reconnect.stable_period = parse_duration("RECONNECT_STABLE_PERIOD", &v)?;
        }

        if let Some(v) = take(&mut env, "QUEUE_CAPACITY") {
            config.queue_capacity = parse_num("QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = take(&mut env, "STATUS_INTERVAL") {
            config.status_interval = parse_duration("STATUS_INTERVAL", &v)?;
        }
        if let Some(v) = take(&mut env, "SHUTDOWN_TIMEOUT") {
            config.shutdown_timeout = parse_duration("SHUTDOWN_TIMEOUT", &v)?;
        }
        if let Some(v) = take(&mut env, "LOG_LEVEL") {
            config.log_level = v.to_lowercase();
        }

        skip_unsupported(&mut env)?;
        if let Some(key) = env.keys().next() {
            return Err(BridgeError::UnknownConfigKey(format!("{}{}", ENV_PREFIX, key)));
        }

        config.validate()?;
        Ok(config)
    }

    /// JSON rendering of the effective settings, without the broker password
    pub fn redacted_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.serial.ports.is_empty() {
            return Err(BridgeError::MissingConfig(format!(
                "{}SERIAL_PORTS",
                ENV_PREFIX
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(invalid("SERIAL_BAUD_RATE must be positive"));
        }
        if self.serial.stall_timeout.is_zero() {
            return Err(invalid("SERIAL_TIMEOUT must be positive"));
        }
        if self.serial.max_frame_len < 64 {
            return Err(invalid("MAX_FRAME_LEN must be at least 64 bytes"));
        }
        if self.observer.region.is_empty() {
            return Err(invalid("IATA must not be empty"));
        }
        if self.broker.host.is_empty() {
            return Err(invalid("MQTT1_SERVER must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("MQTT1_PORT must be positive"));
        }
        if self.broker.keep_alive < Duration::from_secs(1) {
            return Err(invalid("MQTT1_KEEPALIVE must be at least 1s"));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(invalid("MQTT1_PASSWORD requires MQTT1_USERNAME"));
        }
        if self.broker.connect_timeout.is_zero() || self.broker.ack_timeout.is_zero() {
            return Err(invalid("broker timeouts must be positive"));
        }
        if self.topics.packets.is_empty()
            || self.topics.status.is_empty()
            || self.topics.debug.as_deref() == Some("")
        {
            return Err(invalid("topic templates must not be empty"));
        }
        if self.reconnect.min_delay.is_zero() {
            return Err(invalid("RECONNECT_MIN_DELAY must be positive"));
        }
        if self.reconnect.min_delay > self.reconnect.max_delay {
            return Err(invalid(
                "RECONNECT_MIN_DELAY must not exceed RECONNECT_MAX_DELAY",
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(invalid("RECONNECT_MULTIPLIER must be at least 1.0"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("QUEUE_CAPACITY must be at least 1"));
        }
        if self.status_interval.is_zero() {
            return Err(invalid("STATUS_INTERVAL must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> BridgeError {
    BridgeError::InvalidConfig(msg.to_string())
}

/// Log and drop keys for features this bridge does not implement
///
/// Values that would merely restate the supported behaviour pass silently.
fn skip_unsupported(env: &mut BTreeMap<String, String>) -> Result<()> {
    if let Some(v) = take(env, "MQTT1_TRANSPORT") {
        if !v.eq_ignore_ascii_case("tcp") {
            warn!(key = "MQTT1_TRANSPORT", value = %v, "Only tcp transport is supported, ignoring");
        }
    }
    if let Some(v) = take(env, "MQTT1_TLS_VERIFY") {
        if !parse_bool("MQTT1_TLS_VERIFY", &v)? {
            warn!(key = "MQTT1_TLS_VERIFY", "Certificates are always verified, ignoring");
        }
    }
    if let Some(v) = take(env, "MQTT1_USE_AUTH_TOKEN") {
        if parse_bool("MQTT1_USE_AUTH_TOKEN", &v)? {
            warn!(key = "MQTT1_USE_AUTH_TOKEN", "Token authentication is not supported, ignoring");
        }
    }

    let unsupported: Vec<String> = env
        .keys()
        .filter(|key| key.starts_with("MQTT1_TOKEN_") || is_extra_broker_key(key))
        .cloned()
        .collect();
    for key in unsupported {
        env.remove(&key);
        warn!(key = %format!("{}{}", ENV_PREFIX, key), "Unsupported setting, ignoring");
    }
    Ok(())
}

/// `MQTT<n>_*` for any broker slot other than the first
fn is_extra_broker_key(key: &str) -> bool {
    key.strip_prefix("MQTT")
        .and_then(|rest| rest.split_once('_'))
        .and_then(|(slot, _)| slot.parse::<u8>().ok())
        .is_some_and(|n| n >= 2)
}

/// Remove a key, treating empty values as unset
fn take(env: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    env.remove(key).filter(|v| !v.is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| BridgeError::InvalidConfig(format!("{}{}={:?}: {}", ENV_PREFIX, key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::InvalidConfig(format!(
            "{}{}={:?}: expected a boolean",
            ENV_PREFIX, key, value
        ))),
    }
}

/// Plain numbers are seconds; anything else goes through humantime
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
        return Err(BridgeError::InvalidConfig(format!(
            "{}{}={:?}: duration must be non-negative",
            ENV_PREFIX, key, value
        )));
    }
    humantime::parse_duration(value)
        .map_err(|e| BridgeError::InvalidConfig(format!("{}{}={:?}: {}", ENV_PREFIX, key, value, e)))
}

/// Collect the effective `MCTOMQTT_*` variables
///
/// `.env` is read first, then `.env.local`, then the process environment;
/// later sources win. Missing files are skipped.
pub fn collect_env(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for name in [".env", ".env.local"] {
        let path = dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => merged.extend(parse_env_file(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BridgeError::Io(e)),
        }
    }
    merged.extend(std::env::vars().filter(|(k, _)| k.starts_with(ENV_PREFIX)));
    Ok(merged)
}

/// Parse `KEY=value` lines in dotenv style
pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    // inline comments only apply to unquoted values
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<String>) -> Self {
        self.config.serial.ports = vec![port.into()];
        self
    }

    /// Set the partial-line stall timeout
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial.stall_timeout = timeout;
        self
    }

    /// Set region code
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.observer.region = region.into();
        self
    }

    /// Set a fixed observer public key instead of asking the device
    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.config.observer.public_key = Some(key.into());
        self
    }

    /// Set a fixed observer name
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.config.observer.origin = Some(origin.into());
        self
    }

    /// Set the packets topic template
    pub fn packets_topic(mut self, template: impl Into<String>) -> Self {
        self.config.topics.packets = template.into();
        self
    }

    /// Set the debug topic template
    pub fn debug_topic(mut self, template: impl Into<String>) -> Self {
        self.config.topics.debug = Some(template.into());
        self
    }

    /// Publish firmware debug lines
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Push the host clock to the device at startup
    pub fn sync_time(mut self, enabled: bool) -> Self {
        self.config.observer.sync_time = enabled;
        self
    }

    /// Set publish QoS
    pub fn qos(mut self, qos: Qos) -> Self {
        self.config.broker.qos = qos;
        self
    }

    /// Set the publish acknowledgement timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.broker.ack_timeout = timeout;
        self
    }

    /// Set queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set status heartbeat period
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.config.status_interval = interval;
        self
    }

    /// Set reconnect delays
    pub fn reconnect_delays(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect.min_delay = min;
        self.config.reconnect.max_delay = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Durations render in humantime form
mod humantime_serde {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_minimal_env() {
        let config = BridgeConfig::from_vars(vars(&[("SERIAL_PORTS", "/dev/ttyACM0")])).unwrap();
        assert_eq!(config.serial.ports, vec!["/dev/ttyACM0"]);
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.serial.stall_timeout, Duration::from_secs(2));
        assert_eq!(config.observer.region, "XXX");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.qos, Qos::AtMostOnce);
        assert!(config.broker.status_retain);
        assert!(!config.broker.packets_retain);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(120));
        assert_eq!(config.status_interval, Duration::from_secs(300));
        assert!(config.observer.sync_time);
        assert!(config.topics.debug.is_none());
    }

    #[test]
    fn test_full_env() {
        let config = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyUSB0, /dev/ttyACM0"),
            ("SERIAL_BAUD_RATE", "57600"),
            ("SERIAL_TIMEOUT", "500ms"),
            ("IATA", "ITA"),
            ("PUBLIC_KEY", "abcd1234"),
            ("MQTT1_SERVER", "mqtt.example.org"),
            ("MQTT1_PORT", "8883"),
            ("MQTT1_USE_TLS", "True"),
            ("MQTT1_QOS", "1"),
            ("MQTT1_USERNAME", "observer"),
            ("MQTT1_PASSWORD", "secret"),
            ("RECONNECT_MULTIPLIER", "2"),
            ("STATUS_INTERVAL", "2m"),
        ]))
        .unwrap();

        assert_eq!(config.serial.ports, vec!["/dev/ttyUSB0", "/dev/ttyACM0"]);
        assert_eq!(config.serial.baud_rate, 57600);
        assert_eq!(config.serial.stall_timeout, Duration::from_millis(500));
        assert_eq!(config.observer.region, "ITA");
        assert_eq!(config.observer.public_key.as_deref(), Some("abcd1234"));
        assert!(config.broker.use_tls);
        assert_eq!(config.broker.qos, Qos::AtLeastOnce);
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert_eq!(config.status_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_unrelated_vars_ignored() {
        let mut env = vars(&[("SERIAL_PORTS", "/dev/ttyACM0")]);
        env.push(("HOME".to_string(), "/root".to_string()));
        assert!(BridgeConfig::from_vars(env).is_ok());
    }

    #[test]
    fn test_missing_ports_is_fatal() {
        let err = BridgeConfig::from_vars(vars(&[("IATA", "ITA")])).unwrap_err();
        assert!(matches!(err, BridgeError::MissingConfig(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let err = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyACM0"),
            ("MQTT1_SEVRER", "typo"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownConfigKey(ref k) if k == "MCTOMQTT_MQTT1_SEVRER"));
    }

    #[test]
    fn test_legacy_keys_accepted() {
        let config = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyACM0"),
            ("IATA", "SEA"),
            ("MQTT1_ENABLED", "true"),
            ("MQTT1_IATA", "ITA"),
            ("MQTT1_TRANSPORT", "websockets"),
            ("MQTT1_TLS_VERIFY", "false"),
            ("MQTT1_USE_AUTH_TOKEN", "true"),
            ("MQTT1_TOKEN_AUDIENCE", "mqtt.example.org"),
            ("MQTT2_ENABLED", "true"),
            ("MQTT2_SERVER", "other"),
            ("MQTT4_PORT", "1884"),
            ("SYNC_TIME", "false"),
        ]))
        .unwrap();
        assert_eq!(config.observer.region, "ITA");
        assert_eq!(config.broker.host, "localhost");
        assert!(!config.observer.sync_time);
    }

    #[test]
    fn test_disabled_broker_is_fatal() {
        let err = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyACM0"),
            ("MQTT1_ENABLED", "false"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(ref msg) if msg.contains("MQTT1_ENABLED")));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_per_broker_topics_override_global() {
        let config = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyACM0"),
            ("TOPIC_PACKETS", "global/{IATA}/packets"),
            ("TOPIC_DEBUG", "global/{IATA}/debug"),
            ("MQTT1_TOPIC_PACKETS", "b1/{IATA}/packets"),
            ("MQTT1_TOPIC_DEBUG", "b1/{IATA}/debug"),
        ]))
        .unwrap();
        assert_eq!(config.topics.packets, "b1/{IATA}/packets");
        assert_eq!(config.topics.status, DEFAULT_STATUS_TOPIC);
        assert_eq!(config.topics.debug.as_deref(), Some("b1/{IATA}/debug"));
    }

    #[test]
    fn test_extra_broker_keys() {
        assert!(is_extra_broker_key("MQTT2_SERVER"));
        assert!(is_extra_broker_key("MQTT4_TOPIC_STATUS"));
        assert!(!is_extra_broker_key("MQTT1_SERVER"));
        assert!(!is_extra_broker_key("MQTTX_SERVER"));
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        for (key, value) in [
            ("MQTT1_QOS", "3"),
            ("MQTT1_PORT", "99999"),
            ("MQTT1_RETAIN", "maybe"),
            ("SERIAL_TIMEOUT", "soon"),
            ("RECONNECT_MULTIPLIER", "0.5"),
            ("QUEUE_CAPACITY", "0"),
        ] {
            let result =
                BridgeConfig::from_vars(vars(&[("SERIAL_PORTS", "/dev/ttyACM0"), (key, value)]));
            assert!(
                matches!(result, Err(BridgeError::InvalidConfig(_))),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_min_delay_above_max_rejected() {
        let result = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyACM0"),
            ("RECONNECT_MIN_DELAY", "10"),
            ("RECONNECT_MAX_DELAY", "5"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_env_file() {
        let parsed = parse_env_file(
            "# comment\n\
             MCTOMQTT_IATA=ITA\n\
             export MCTOMQTT_SERIAL_PORTS=\"/dev/ttyUSB0\"\n\
             MCTOMQTT_ORIGIN=my node # trailing\n\
             MCTOMQTT_TOPIC_STATUS='a/#/b'\n\
             not a pair\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("MCTOMQTT_IATA".to_string(), "ITA".to_string()),
                ("MCTOMQTT_SERIAL_PORTS".to_string(), "/dev/ttyUSB0".to_string()),
                ("MCTOMQTT_ORIGIN".to_string(), "my node".to_string()),
                ("MCTOMQTT_TOPIC_STATUS".to_string(), "a/#/b".to_string()),
            ]
        );
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfigBuilder::new()
            .serial_port("/dev/ttyACM1")
            .region("ITA")
            .public_key("ABCD1234")
            .queue_capacity(8)
            .build();

        assert_eq!(config.serial.ports, vec!["/dev/ttyACM1"]);
        assert_eq!(config.queue_capacity, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redacted_json() {
        let config = BridgeConfig::from_vars(vars(&[
            ("SERIAL_PORTS", "/dev/ttyACM0"),
            ("MQTT1_USERNAME", "observer"),
            ("MQTT1_PASSWORD", "secret"),
            ("MQTT1_QOS", "1"),
            ("RECONNECT_MIN_DELAY", "500ms"),
        ]))
        .unwrap();
        let text = config.redacted_json().unwrap();
        assert!(!text.contains("secret"));

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["broker"]["username"], "observer");
        assert_eq!(json["broker"]["qos"], 1);
        assert_eq!(json["reconnect"]["min_delay"], "500ms");
        assert_eq!(json["status_interval"], "5m");
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(rumqttc::QoS::from(Qos::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
        assert!(Qos::try_from(3).is_err());
    }
}
