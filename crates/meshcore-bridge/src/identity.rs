//! Observer identity
//!
//! Built once at startup from configuration and the
//! device CLI, then shared immutably behind an `Arc`.

use crate::error::{BridgeError, Result};

/// Maximum client id length accepted by MQTT 3.1 brokers
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Value reported when the device does not know a field
pub const UNKNOWN: &str = "unknown";

/// Identity of the observer radio this bridge serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverIdentity {
    /// Upper-case hex public key
    pub public_key: String,
    /// Region code
    pub region: String,
    /// Device name, if known
    pub name: Option<String>,
    /// Radio parameters as reported by `get radio`
    pub radio: Option<String>,
    /// Firmware version as reported by `ver`
    pub firmware_version: Option<String>,
    /// Board model as reported by `board`
    pub model: Option<String>,
}

impl ObserverIdentity {
    /// Create an identity from a public key and region
    pub fn new(public_key: &str, region: impl Into<String>) -> Result<Self> {
        Ok(Self {
            public_key: normalize_public_key(public_key)?,
            region: region.into(),
            name: None,
            radio: None,
            firmware_version: None,
            model: None,
        })
    }

    /// Set the device name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in payloads, falling back to the key prefix
    pub fn origin(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => &self.public_key[..self.public_key.len().min(8)],
        }
    }

    /// MQTT client id: prefix plus origin, restricted to `[A-Za-z0-9_-]`
    pub fn client_id(&self, prefix: &str) -> String {
        let mut id: String = format!("{}{}", prefix, self.origin())
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        id.truncate(MAX_CLIENT_ID_LEN);
        id
    }
}

/// Version string reported in status messages
pub fn client_version() -> String {
    format!("meshcore-bridge/{}", env!("CARGO_PKG_VERSION"))
}

/// Validate a hex public key and upper-case it
pub fn normalize_public_key(key: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(BridgeError::InvalidConfig(
            "public key must not be empty".to_string(),
        ));
    }
    if key.len() % 2 != 0 || hex::decode(key).is_err() {
        return Err(BridgeError::InvalidConfig(format!(
            "public key is not valid hex: {}",
            key
        )));
    }
    Ok(key.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_normalized() {
        let id = ObserverIdentity::new("abcd1234", "ITA").unwrap();
        assert_eq!(id.public_key, "ABCD1234");
        assert!(ObserverIdentity::new("xyz", "ITA").is_err());
        assert!(ObserverIdentity::new("abc", "ITA").is_err());
        assert!(ObserverIdentity::new("", "ITA").is_err());
    }

    #[test]
    fn test_origin_falls_back_to_key_prefix() {
        let id = ObserverIdentity::new(&"AB".repeat(32), "ITA").unwrap();
        assert_eq!(id.origin(), "ABABABAB");
        assert_eq!(id.with_name("Hilltop").origin(), "Hilltop");
    }

    #[test]
    fn test_client_id_sanitized_and_truncated() {
        let id = ObserverIdentity::new("ABCD1234", "ITA")
            .unwrap()
            .with_name("Hill top / repeater #2 (north side)");
        let client_id = id.client_id("meshcore_");
        assert!(client_id.len() <= MAX_CLIENT_ID_LEN);
        assert!(client_id.starts_with("meshcore_Hill_top"));
        assert!(client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn test_client_version() {
        assert!(client_version().starts_with("meshcore-bridge/"));
    }
}
