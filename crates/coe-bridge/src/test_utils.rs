//! Test utilities for exercising a bridge without an MQTT broker or a CMI
//!
//! [`RecordingPublisher`] stands in for the MQTT side and remembers every
//! update it was handed. The frame builders produce raw CoE datagrams the way
//! a CMI would put them on the wire.
//!
//! # Example
//!
//! ```rust,ignore
//! use coe_bridge::test_utils::{digital_frame, RecordingPublisher};
//!
//! let publisher = RecordingPublisher::shared();
//! let bridge = CoeBridge::new(config, publisher.clone()).await?;
//! bridge.start().await?;
//!
//! socket.send_to(&digital_frame(1, 0, 0x8000), bridge.local_addr()?).await?;
//! assert!(publisher.wait_for(16, Duration::from_secs(2)).await);
//! ```

use async_trait::async_trait;
use coe_protocol::DIGITAL_FRAME_LEN;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bridge::StatePublisher;
use crate::error::{CoeError, Result};
use crate::registry::{AnalogValue, DigitalValue};

/// One call received by a [`RecordingPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub enum PublishedUpdate {
    /// `publish_sensor_update`
    Sensor {
        /// Reporting CMI
        source: IpAddr,
        /// Published value
        value: AnalogValue,
    },
    /// `publish_binary_update`
    Binary {
        /// Reporting CMI
        source: IpAddr,
        /// Published state
        value: DigitalValue,
    },
    /// `publish_device_availability`
    Availability {
        /// CMI address
        peer: IpAddr,
        /// Reported availability
        online: bool,
    },
}

/// State publisher that records every update
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    updates: Mutex<Vec<PublishedUpdate>>,
    notify: Notify,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty recorder ready to hand to a bridge
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every following call fail (the update is still recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All updates in the order they were published
    pub fn updates(&self) -> Vec<PublishedUpdate> {
        self.updates.lock().clone()
    }

    /// Published analog values
    pub fn sensor_updates(&self) -> Vec<AnalogValue> {
        self.updates
            .lock()
            .iter()
            .filter_map(|update| match update {
                PublishedUpdate::Sensor { value, .. } => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Published digital states
    pub fn binary_updates(&self) -> Vec<DigitalValue> {
        self.updates
            .lock()
            .iter()
            .filter_map(|update| match update {
                PublishedUpdate::Binary { value, .. } => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded updates
    pub fn len(&self) -> usize {
        self.updates.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.updates.lock().clear();
    }

    /// Wait until at least `count` updates were recorded
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= count;
            }
        }
    }

    fn record(&self, update: PublishedUpdate) -> Result<()> {
        self.updates.lock().push(update);
        self.notify.notify_waiters();
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoeError::Publish("broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatePublisher for RecordingPublisher {
    async fn publish_sensor_update(&self, source: IpAddr, value: AnalogValue) -> Result<()> {
        self.record(PublishedUpdate::Sensor { source, value })
    }

    async fn publish_binary_update(&self, source: IpAddr, value: DigitalValue) -> Result<()> {
        self.record(PublishedUpdate::Binary { source, value })
    }

    async fn publish_device_availability(&self, peer: IpAddr, online: bool) -> Result<()> {
        self.record(PublishedUpdate::Availability { peer, online })
    }
}

/// Raw digital datagram; bit 15 of `bits` is the first wire bit
pub fn digital_frame(node: u8, page: u8, bits: u16) -> Vec<u8> {
    let mut frame = vec![0u8; DIGITAL_FRAME_LEN];
    frame[0] = node;
    frame[1] = page;
    frame[2..4].copy_from_slice(&bits.to_be_bytes());
    frame
}

/// Raw analog datagram with 16-bit values
pub fn analog_frame_v1(node: u8, page: u8, values: [i16; 4], measures: [u8; 4]) -> Vec<u8> {
    let mut frame = vec![node, page];
    for value in values {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame.extend_from_slice(&measures);
    frame
}

/// Raw analog datagram with 32-bit values
pub fn analog_frame_v2(node: u8, page: u8, values: [i32; 4], measures: [u8; 4]) -> Vec<u8> {
    let mut frame = vec![node, page];
    for value in values {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame.extend_from_slice(&measures);
    frame
}
