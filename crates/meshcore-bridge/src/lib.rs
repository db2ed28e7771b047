//! MeshCore observer radio to MQTT bridge
//!
//! This crate reads the packet log of a MeshCore repeater running in
//! packet-logging mode over a serial line, turns every logged packet into a
//! JSON event and publishes it to an MQTT broker, together with a retained
//! observer status heartbeat.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Device Interface** - Serial connection to the observer radio
//! 2. **Decoding** - Log lines to frames, frames to classified packets
//! 3. **Mapping** - Packets and statuses to topics and JSON payloads
//! 4. **Delivery** - Bounded queue drained by the MQTT broker manager
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshcore_bridge::{BridgeConfig, MeshcoreBridge, MqttConnector, SerialInterface};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::from_env()?;
//!     let interface = SerialInterface::from_config(&config.serial);
//!     let connector = MqttConnector::new(config.broker.clone());
//!
//!     MeshcoreBridge::new(config, interface, connector).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//!
//! # Message Flow
//!
//! 1. The repeater prints `U RAW: <hex>` followed by `U: RX, ...` / `U: TX, ...`
//! 2. [`FrameDecoder`] pairs them into a [`RawFrame`]
//! 3. [`classify`] reads the MeshCore header and tags the packet kind
//! 4. [`PayloadMapper`] renders the topic and JSON payload
//! 5. [`PublishQueue`] buffers attempts (drop-oldest under backpressure)
//! 6. The broker manager publishes them at the configured QoS
//!
//! Alongside the packet flow, the status ticker asks the serial manager to
//! run `stats-core` / `stats-radio` on the device CLI and publishes the
//! result in the retained status message.
//!
//! # Protocol Details
//!
//! MeshCore packets start with a header byte:
//! - Bits 0-1: Route type
//! - Bits 2-5: Payload type
//! - Bits 6-7: Payload version
//!
//! followed by optional transport codes, the path and the payload.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod identity;
pub mod interface;

// Decoding
pub mod classifier;
pub mod codec;

// Publishing
pub mod mapper;
pub mod queue;
pub mod status;

// Connection management
pub mod backoff;
pub mod broker;
pub mod cli;
pub mod serial_manager;

// Orchestration
pub mod bridge;

// Testing utilities
pub mod test_utils;

pub use config::{
    BridgeConfig, BridgeConfigBuilder, BrokerConfig, ObserverConfig, Qos, ReconnectConfig,
    SerialConfig, TopicConfig,
};
pub use error::{BridgeError, FramingError, Result};
pub use identity::ObserverIdentity;
pub use interface::{ConnectionState, ObserverInterface, StateWatch};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use classifier::{classify, DecodedPacket, PacketKind, PublicKey, RouteType};
pub use codec::{Direction, FrameDecoder, PacketSummary, RawFrame};

pub use mapper::{MessageClass, PayloadMapper, PublishAttempt};
pub use queue::{PublishQueue, PushOutcome};
pub use status::{BridgeCounters, CounterSnapshot, DeviceStats, Presence, StatusSnapshot};

pub use broker::{BrokerConnector, BrokerManager, BrokerSession, MqttConnector};
pub use cli::CliSession;
pub use serial_manager::{DebugSink, FrameSink, SerialManager, StatsRequest};

pub use bridge::{BridgeHandle, MeshcoreBridge};

pub use test_utils::{MockBroker, MockDevice, MockInterface};

pub use config::{DEFAULT_BAUD_RATE, DEFAULT_MAX_FRAME_LEN, ENV_PREFIX};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
