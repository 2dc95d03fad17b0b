//! Analog channel registry

use bytes::Bytes;
use coe_protocol::{AnalogSlot, MeasureType, Message};
use parking_lot::Mutex;
use std::net::IpAddr;
use tracing::{debug, trace};

use super::{
    analog_page_for_channel, analog_slot_for_index, inbound_analog_channel, ChangeCallback,
    ChannelTable, UNKNOWN_ADDRESS, UNKNOWN_ANALOG_VALUE,
};
use crate::error::Result;
use crate::node_registry::SharedNodeRegistry;

/// Snapshot of an analog channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogValue {
    /// CAN node id, or -1 for the unknown sentinel
    pub node: i32,
    /// Channel number, or -1 for the unknown sentinel
    pub channel: i32,
    /// Physical value
    pub value: f64,
    /// Measure type of the value
    pub measure: MeasureType,
}

impl AnalogValue {
    /// Create a snapshot
    pub fn new(node: u8, channel: u16, value: f64, measure: MeasureType) -> Self {
        Self {
            node: i32::from(node),
            channel: i32::from(channel),
            value,
            measure,
        }
    }

    /// Sentinel returned for channels that were never set
    pub fn unknown() -> Self {
        Self {
            node: UNKNOWN_ADDRESS,
            channel: UNKNOWN_ADDRESS,
            value: UNKNOWN_ANALOG_VALUE,
            measure: MeasureType::None,
        }
    }

    /// Whether this is the unknown sentinel
    pub fn is_unknown(&self) -> bool {
        self.node == UNKNOWN_ADDRESS && self.channel == UNKNOWN_ADDRESS
    }

    /// Unit suffix of the measure type
    pub fn unit(&self) -> &'static str {
        self.measure.unit()
    }
}

/// Last known value of analog channels for one direction of traffic
pub struct AnalogChannels {
    table: Mutex<ChannelTable<AnalogSlot>>,
    node_registry: Option<SharedNodeRegistry>,
    on_changed: Option<ChangeCallback<AnalogValue>>,
}

impl AnalogChannels {
    /// Create a receive-only registry
    pub fn new() -> Self {
        Self {
            table: Mutex::new(ChannelTable::new()),
            node_registry: None,
            on_changed: None,
        }
    }

    /// Create a registry whose writes are serialized through `node_registry`
    pub fn with_node_registry(node_registry: SharedNodeRegistry) -> Self {
        Self {
            node_registry: Some(node_registry),
            ..Self::new()
        }
    }

    /// Register the change callback used by [`submit_message`](Self::submit_message)
    pub fn on_changed_value(mut self, callback: ChangeCallback<AnalogValue>) -> Self {
        self.on_changed = Some(callback);
        self
    }

    /// Last known value of a channel, or [`AnalogValue::unknown`]
    pub fn channel_data(&self, node: u8, channel: u16) -> AnalogValue {
        self.table
            .lock()
            .get(node, channel)
            .map(|slot| AnalogValue::new(node, channel, slot.value, slot.measure))
            .unwrap_or_else(AnalogValue::unknown)
    }

    /// Write a channel and return the serialized page carrying it
    ///
    /// Values that do not fit the peer's field width are rejected before any
    /// state changes. The returned bytes are empty when the registry has no
    /// backing node registry.
    pub fn set_channel(
        &self,
        node: u8,
        channel: u16,
        value: f64,
        measure: MeasureType,
    ) -> Result<Vec<u8>> {
        let (page, index) = analog_page_for_channel(channel)?;
        let slot = analog_slot_for_index(index);

        // Lock order: table, then node registry
        let mut table = self.table.lock();
        let bytes = match &self.node_registry {
            Some(registry) => {
                let mut registry = registry.lock();
                registry.version().check_value(value, measure)?;
                registry.update_analog_entry(node, page, slot, value, measure)?;
                registry.page_bytes(node, page)?.to_vec()
            }
            None => Vec::new(),
        };

        table.store(node, channel, AnalogSlot::new(value, measure));
        table.mark_written(node, page);
        debug!(node, channel, page, slot, value, %measure, "Analog channel set");

        Ok(bytes)
    }

    /// Apply an inbound page, notifying the change callback
    ///
    /// Slots tagged with no measure type carry no value and are skipped.
    /// A channel counts as changed when its value differs from the stored
    /// one or it was never seen before. Digital messages are ignored.
    pub fn submit_message(&self, sender: IpAddr, message: &Message) -> usize {
        let Message::Analog(page) = message else {
            trace!(page = message.page(), "Ignoring digital page in analog registry");
            return 0;
        };

        let mut changed = Vec::new();
        {
            let mut table = self.table.lock();
            for (slot_index, slot) in page.changes() {
                let channel = inbound_analog_channel(page.page, slot_index);
                let previous = table.store(page.node, channel, slot);
                if previous.map(|p| p.value) != Some(slot.value) {
                    changed.push(AnalogValue::new(page.node, channel, slot.value, slot.measure));
                }
            }
        }

        if let Some(callback) = &self.on_changed {
            for value in &changed {
                trace!(
                    node = value.node,
                    channel = value.channel,
                    value = value.value,
                    "Analog channel changed"
                );
                callback(sender, *value);
            }
        }

        changed.len()
    }

    /// Serialized bytes of every page written through this registry
    pub fn bytes_for_all_written_pages(&self) -> Vec<Bytes> {
        let Some(registry) = &self.node_registry else {
            return Vec::new();
        };
        let written = self.written_pages();
        let registry = registry.lock();
        written
            .into_iter()
            .filter_map(|(node, page)| registry.page_bytes(node, page).ok())
            .collect()
    }

    /// (node, page) pairs written through this registry
    pub fn written_pages(&self) -> Vec<(u8, u8)> {
        self.table.lock().written_pages()
    }

    /// Number of channels with a known value
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether no channel has a known value
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnalogChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnalogChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogChannels")
            .field("channels", &self.len())
            .field("backed", &self.node_registry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoeError;
    use crate::node_registry::CanNodeRegistry;
    use coe_protocol::{AnalogPage, CodecError, CoeVersion};
    use std::sync::Arc;

    fn sender() -> IpAddr {
        "192.168.1.60".parse().unwrap()
    }

    fn recording() -> (ChangeCallback<AnalogValue>, Arc<Mutex<Vec<AnalogValue>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ChangeCallback<AnalogValue> = Arc::new(move |_, value| {
            sink.lock().push(value);
        });
        (callback, seen)
    }

    #[test]
    fn test_unknown_channel_default() {
        let registry = AnalogChannels::new();
        let value = registry.channel_data(1, 1);
        assert!(value.is_unknown());
        assert_eq!(value.node, -1);
        assert_eq!(value.channel, -1);
        assert_eq!(value.value, -9999.0);
        assert_eq!(value.measure, MeasureType::None);
    }

    #[test]
    fn test_inbound_temperature() {
        let (callback, seen) = recording();
        let registry = AnalogChannels::new().on_changed_value(callback);

        let message = Message::decode(
            &[3, 2, 250, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0],
            CoeVersion::V1,
        )
        .unwrap();
        assert_eq!(registry.submit_message(sender(), &message), 1);

        let value = registry.channel_data(3, 5);
        assert_eq!(value.value, 25.0);
        assert_eq!(value.measure, MeasureType::Temperature);
        assert_eq!(value.unit(), "°C");
        assert_eq!(seen.lock().as_slice(), &[value]);
    }

    #[test]
    fn test_unchanged_value_does_not_fire() {
        let (callback, seen) = recording();
        let registry = AnalogChannels::new().on_changed_value(callback);

        let mut page = AnalogPage::new(1, 1);
        page.slots[2] = AnalogSlot::new(12.5, MeasureType::Temperature);
        let message = Message::Analog(page.clone());

        assert_eq!(registry.submit_message(sender(), &message), 1);
        assert_eq!(registry.submit_message(sender(), &message), 0);

        page.slots[2].value = 13.0;
        assert_eq!(registry.submit_message(sender(), &Message::Analog(page)), 1);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], AnalogValue::new(1, 3, 13.0, MeasureType::Temperature));
    }

    #[test]
    fn test_measure_change_alone_does_not_fire() {
        let (callback, seen) = recording();
        let registry = AnalogChannels::new().on_changed_value(callback);

        let mut page = AnalogPage::new(1, 1);
        page.slots[2] = AnalogSlot::new(12.5, MeasureType::Temperature);
        assert_eq!(registry.submit_message(sender(), &Message::Analog(page.clone())), 1);

        page.slots[2].measure = MeasureType::Percent;
        assert_eq!(registry.submit_message(sender(), &Message::Analog(page)), 0);

        // Stored slot still takes the new measure type
        let value = registry.channel_data(1, 3);
        assert_eq!(value.value, 12.5);
        assert_eq!(value.measure, MeasureType::Percent);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_first_zero_value_fires() {
        let (callback, seen) = recording();
        let registry = AnalogChannels::new().on_changed_value(callback);

        let mut page = AnalogPage::new(2, 8);
        page.slots[3] = AnalogSlot::new(0.0, MeasureType::Kilowatt);
        registry.submit_message(sender(), &Message::Analog(page));

        assert_eq!(
            seen.lock().as_slice(),
            &[AnalogValue::new(2, 32, 0.0, MeasureType::Kilowatt)]
        );
    }

    #[test]
    fn test_none_slots_skipped() {
        let registry = AnalogChannels::new();
        let message = Message::Analog(AnalogPage::new(1, 4));
        assert_eq!(registry.submit_message(sender(), &message), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_outbound_write_returns_page() {
        let node_registry = CanNodeRegistry::shared(CoeVersion::V1);
        let registry = AnalogChannels::with_node_registry(node_registry);

        let bytes = registry
            .set_channel(4, 5, 21.5, MeasureType::Temperature)
            .unwrap();
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[..2], &[4, 2]);
        assert_eq!(&bytes[2..4], &215i16.to_le_bytes());
        assert_eq!(&bytes[10..], &[1, 0, 0, 0]);

        let bytes = registry.set_channel(4, 8, 3.0, MeasureType::Bar).unwrap();
        assert_eq!(&bytes[8..10], &300i16.to_le_bytes());
        assert_eq!(&bytes[10..], &[1, 0, 0, 23]);

        assert_eq!(
            registry.channel_data(4, 8),
            AnalogValue::new(4, 8, 3.0, MeasureType::Bar)
        );
    }

    #[test]
    fn test_outbound_page_decodes_to_same_channel() {
        let node_registry = CanNodeRegistry::shared(CoeVersion::V2);
        let outbound = AnalogChannels::with_node_registry(node_registry);
        let inbound = AnalogChannels::new();

        let bytes = outbound
            .set_channel(6, 11, 1234.5, MeasureType::KilowattHours)
            .unwrap();
        assert_eq!(bytes.len(), 22);

        let message = Message::decode(&bytes, CoeVersion::V2).unwrap();
        inbound.submit_message(sender(), &message);
        assert_eq!(
            inbound.channel_data(6, 11),
            AnalogValue::new(6, 11, 1234.5, MeasureType::KilowattHours)
        );
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let node_registry = CanNodeRegistry::shared(CoeVersion::V1);
        let registry = AnalogChannels::with_node_registry(node_registry.clone());

        let err = registry
            .set_channel(1, 1, 5000.0, MeasureType::Temperature)
            .unwrap_err();
        assert!(matches!(
            err,
            CoeError::Codec(CodecError::ValueOutOfRange { .. })
        ));
        assert!(registry.is_empty());
        assert!(!node_registry.lock().contains_node(1));
    }

    #[test]
    fn test_out_of_range_channel_rejected() {
        let registry = AnalogChannels::new();
        assert!(matches!(
            registry.set_channel(1, 0, 1.0, MeasureType::None),
            Err(CoeError::ChannelOutOfRange { kind: "analog", .. })
        ));
        assert!(registry.set_channel(1, 33, 1.0, MeasureType::None).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_digital_message_ignored() {
        let registry = AnalogChannels::new();
        let message = Message::Digital(coe_protocol::DigitalPage::new(1, 0));
        assert_eq!(registry.submit_message(sender(), &message), 0);
    }
}
