//! Device CLI: identity queries, clock sync and statistics
//!
//! The repeater firmware answers CLI commands with a line of the form
//! `  -> > value` (settings) or `  -> value` (informational commands).
//! Packet log lines may be interleaved with the reply, so only lines that
//! start with the reply arrow are considered. Everything read while a
//! command is outstanding is kept so those packet lines can still be
//! decoded afterwards.

use crate::config::ObserverConfig;
use crate::error::{BridgeError, Result};
use crate::identity::{normalize_public_key, ObserverIdentity, UNKNOWN};
use crate::interface::ObserverInterface;
use crate::status::DeviceStats;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Reply window for most commands
pub const REPLY_WINDOW: Duration = Duration::from_millis(500);

/// Reply window for key queries, which are slower on some boards
pub const KEY_REPLY_WINDOW: Duration = Duration::from_secs(1);

/// Commands whose JSON replies make up [`DeviceStats`]
pub const STATS_COMMANDS: [&str; 2] = ["stats-core", "stats-radio"];

/// Hex length of a device public key
const PUBLIC_KEY_HEX_LEN: usize = 64;

const UNKNOWN_COMMAND: &str = "Unknown command";

/// Pull the value out of a CLI response
pub fn extract_reply(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("->")?.trim_start();
        let rest = rest.strip_prefix('>').unwrap_or(rest);
        let value = rest.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Parse the JSON reply of a stats command
///
/// Older firmware answers `Unknown command`; that and anything that is not
/// a JSON object yield `None`.
pub fn parse_stats_reply(response: &str) -> Option<DeviceStats> {
    let reply = extract_reply(response)?;
    if reply.starts_with(UNKNOWN_COMMAND) {
        return None;
    }
    serde_json::from_str(&reply).ok()
}

/// Command/reply exchange with the device
///
/// Borrows the interface for the duration of the exchange. Bytes read while
/// waiting for replies are retained; see [`CliSession::into_captured`].
pub struct CliSession<'a, I: ObserverInterface + ?Sized> {
    iface: &'a mut I,
    captured: BytesMut,
}

impl<'a, I> CliSession<'a, I>
where
    I: ObserverInterface + ?Sized,
{
    /// Start an exchange on a connected interface
    pub fn new(iface: &'a mut I) -> Self {
        Self {
            iface,
            captured: BytesMut::new(),
        }
    }

    /// Send a CLI command and collect everything the device prints for `window`
    pub async fn command(&mut self, cmd: &str, window: Duration) -> Result<String> {
        self.iface
            .write_bytes(format!("{}\r\n", cmd).as_bytes())
            .await?;
        debug!(command = cmd, "Sent CLI command");

        let start = self.captured.len();
        let deadline = Instant::now() + window;
        loop {
            match timeout_at(deadline, self.iface.read_chunk()).await {
                Ok(Ok(chunk)) => self.captured.extend_from_slice(&chunk),
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }

        let text = String::from_utf8_lossy(&self.captured[start..]).into_owned();
        debug!(command = cmd, response = %text.trim(), "CLI response");
        Ok(text)
    }

    async fn query(&mut self, cmd: &str, window: Duration) -> Result<Option<String>> {
        let response = self.command(cmd, window).await?;
        let reply = extract_reply(&response);
        if reply.is_none() {
            warn!(command = cmd, "No reply from device");
        }
        Ok(reply)
    }

    /// Set the device clock to the host time
    pub async fn sync_clock(&mut self) -> Result<()> {
        let epoch = chrono::Utc::now().timestamp();
        self.command(&format!("time {}", epoch), REPLY_WINDOW).await?;
        info!(epoch, "Synchronised device clock");
        Ok(())
    }

    /// Build the observer identity, asking the device for whatever is not configured
    ///
    /// The public key is mandatory; the remaining fields are best effort.
    /// Interface errors are returned so the caller can reconnect and retry.
    pub async fn identity(&mut self, observer: &ObserverConfig) -> Result<ObserverIdentity> {
        if observer.sync_time {
            self.sync_clock().await?;
        }

        let public_key = match &observer.public_key {
            Some(key) => normalize_public_key(key)?,
            None => {
                let reply = self
                    .query("get public.key", KEY_REPLY_WINDOW)
                    .await?
                    .ok_or_else(|| {
                        BridgeError::DeviceQueryFailed("no reply to get public.key".into())
                    })?;
                let key: String = reply.chars().filter(|c| !c.is_whitespace()).collect();
                if key.len() != PUBLIC_KEY_HEX_LEN {
                    return Err(BridgeError::DeviceQueryFailed(format!(
                        "public key has {} hex digits, expected {}",
                        key.len(),
                        PUBLIC_KEY_HEX_LEN
                    )));
                }
                normalize_public_key(&key).map_err(|_| {
                    BridgeError::DeviceQueryFailed(format!("public key is not hex: {}", key))
                })?
            }
        };

        let mut identity = ObserverIdentity::new(&public_key, observer.region.clone())?;

        identity.name = match &observer.origin {
            Some(origin) => Some(origin.clone()),
            None => self.query("get name", REPLY_WINDOW).await?,
        };
        identity.radio = self.query("get radio", REPLY_WINDOW).await?;
        identity.firmware_version = self.query("ver", REPLY_WINDOW).await?;
        identity.model = self.query("board", REPLY_WINDOW).await?.map(|board| {
            if board == UNKNOWN_COMMAND {
                UNKNOWN.to_string()
            } else {
                board
            }
        });

        info!(
            public_key = %identity.public_key,
            name = identity.origin(),
            firmware = identity.firmware_version.as_deref().unwrap_or(UNKNOWN),
            model = identity.model.as_deref().unwrap_or(UNKNOWN),
            "Observer identity resolved"
        );
        Ok(identity)
    }

    /// Query `stats-core` and `stats-radio` and merge the replies
    ///
    /// Commands the firmware does not know contribute nothing, so the result
    /// may be empty.
    pub async fn device_stats(&mut self) -> Result<DeviceStats> {
        let mut stats = DeviceStats::default();
        for cmd in STATS_COMMANDS {
            let response = self.command(cmd, REPLY_WINDOW).await?;
            match parse_stats_reply(&response) {
                Some(part) => stats.merge(part),
                None => debug!(command = cmd, "No statistics in reply"),
            }
        }
        Ok(stats)
    }

    /// Everything read from the device during this exchange
    pub fn into_captured(self) -> Bytes {
        self.captured.freeze()
    }
}

/// Identity built from configuration alone, without touching the device
pub fn configured_identity(observer: &ObserverConfig) -> Option<Result<ObserverIdentity>> {
    let key = observer.public_key.as_ref()?;
    Some(ObserverIdentity::new(key, observer.region.clone()).map(|mut identity| {
        identity.name = observer.origin.clone();
        identity
    }))
}
