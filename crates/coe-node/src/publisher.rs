//! Log-backed state publisher
//!
//! Renders every update as the topic/payload pair an MQTT integration would
//! publish and writes it to the log.

use async_trait::async_trait;
use coe_bridge::{AnalogValue, DigitalValue, Result, StatePublisher};
use serde::Serialize;
use std::net::IpAddr;
use tracing::info;

/// Root of every topic
pub const TOPIC_PREFIX: &str = "coe";

#[derive(Debug, Serialize)]
struct SensorPayload<'a> {
    value: f64,
    unit: &'a str,
    measure: &'a str,
}

/// Topic of an analog channel
pub fn sensor_topic(source: IpAddr, value: &AnalogValue) -> String {
    format!(
        "{}/{}/{}/analog/{}",
        TOPIC_PREFIX, source, value.node, value.channel
    )
}

/// Topic of a digital channel
pub fn binary_topic(source: IpAddr, value: &DigitalValue) -> String {
    format!(
        "{}/{}/{}/digital/{}",
        TOPIC_PREFIX, source, value.node, value.channel
    )
}

/// Topic of a CMI's availability
pub fn availability_topic(peer: IpAddr) -> String {
    format!("{}/{}/availability", TOPIC_PREFIX, peer)
}

/// JSON payload of an analog channel
pub fn sensor_payload(value: &AnalogValue) -> String {
    let payload = SensorPayload {
        value: value.value,
        unit: value.measure.unit(),
        measure: value.measure.name(),
    };
    serde_json::to_string(&payload).unwrap_or_else(|_| value.value.to_string())
}

/// Publisher that logs topic and payload of every update
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl StatePublisher for LogPublisher {
    async fn publish_sensor_update(&self, source: IpAddr, value: AnalogValue) -> Result<()> {
        info!(
            topic = %sensor_topic(source, &value),
            payload = %sensor_payload(&value),
            "publish"
        );
        Ok(())
    }

    async fn publish_binary_update(&self, source: IpAddr, value: DigitalValue) -> Result<()> {
        let payload = if value.state { "ON" } else { "OFF" };
        info!(topic = %binary_topic(source, &value), payload, "publish");
        Ok(())
    }

    async fn publish_device_availability(&self, peer: IpAddr, online: bool) -> Result<()> {
        let payload = if online { "online" } else { "offline" };
        info!(topic = %availability_topic(peer), payload, "publish");
        Ok(())
    }
}
