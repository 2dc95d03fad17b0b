//! CoE Bridge - CAN-over-Ethernet integration for CMI devices
//!
//! This crate connects CMI controllers, which expose CAN bus channels as
//! UDP datagrams on port 5441, to a home automation state publisher. It
//! keeps the last known value of every channel in both directions and
//! resynchronises written channels periodically, since CoE offers no
//! acknowledgement.
//!
//! # Architecture
//!
//! The bridge is built in layers:
//!
//! 1. **Wire codec** - [`coe_protocol`] translates datagrams to typed pages
//! 2. **Node registry** - ten-page images of the nodes written to a CMI
//! 3. **Channel registries** - last known values, change detection and
//!    channel-to-page addressing
//! 4. **Transport** - a receive task and per-peer fire-and-forget senders
//! 5. **Bridge** - wiring, periodic resend, availability and publication
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use coe_bridge::{BridgeConfigBuilder, CoeBridge, PeerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cmi = "192.168.1.50".parse()?;
//!     let config = BridgeConfigBuilder::new()
//!         .peer(PeerConfig::new(cmi))
//!         .build();
//!
//!     let bridge = CoeBridge::new(config, publisher).await?;
//!     bridge.start().await?;
//!
//!     // Switch digital output 3 of CAN node 30 on the CMI
//!     bridge.write_switch(cmi, 30, 3, true).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Message Flow
//!
//! ## CMI → publisher
//!
//! 1. UdpReceiver reads a datagram and records the sender as alive
//! 2. The page is decoded with the sender's configured protocol version
//! 3. The inbound registries of that CAN node store every value
//! 4. Changed channels are queued and published by the pump task
//!
//! ## caller → CMI
//!
//! 1. `write_switch` / `write_number` update the peer's registries
//! 2. The page carrying the channel is sent immediately
//! 3. Every written page is resent on each resend tick

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;

// State
pub mod node_registry;
pub mod registry;

// I/O and timing
pub mod liveness;
pub mod scheduler;
pub mod transport;

// Integration
pub mod bridge;

// Testing utilities
pub mod test_utils;

pub use config::{BridgeConfig, BridgeConfigBuilder, PeerConfig};
pub use error::{CoeError, Result};

pub use node_registry::{CanNodeRegistry, NodeState, PageContent, SharedNodeRegistry};
pub use registry::{
    AnalogChannels, AnalogValue, ChangeCallback, DigitalChannels, DigitalValue,
    MAX_ANALOG_CHANNEL, MAX_DIGITAL_CHANNEL,
};

pub use liveness::{LivenessTracker, PeerStatus};
pub use scheduler::{ScheduledTask, Scheduler, TaskHandle};
pub use transport::{DatagramHandler, UdpReceiver, UdpSender};

pub use bridge::{BridgeStats, ChannelEvent, CoeBridge, StatePublisher};

pub use test_utils::{PublishedUpdate, RecordingPublisher};

// Protocol re-exports
pub use coe_protocol::{CoeVersion, MeasureType, Message, COE_PORT};

pub use config::{
    DEFAULT_AVAILABILITY_INTERVAL, DEFAULT_EVENT_QUEUE_SIZE, DEFAULT_OFFLINE_AFTER,
    DEFAULT_RESEND_INTERVAL,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
