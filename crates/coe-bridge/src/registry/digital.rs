//! Digital channel registry

use bytes::Bytes;
use coe_protocol::Message;
use parking_lot::Mutex;
use std::net::IpAddr;
use tracing::{debug, trace};

use super::{
    digital_bit_for_index, digital_page_for_channel, inbound_digital_channel, ChangeCallback,
    ChannelTable, UNKNOWN_ADDRESS,
};
use crate::error::Result;
use crate::node_registry::SharedNodeRegistry;

/// Snapshot of a digital channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalValue {
    /// CAN node id, or -1 for the unknown sentinel
    pub node: i32,
    /// Channel number, or -1 for the unknown sentinel
    pub channel: i32,
    /// Bit state
    pub state: bool,
}

impl DigitalValue {
    /// Create a snapshot
    pub fn new(node: u8, channel: u16, state: bool) -> Self {
        Self {
            node: i32::from(node),
            channel: i32::from(channel),
            state,
        }
    }

    /// Sentinel returned for channels that were never set
    pub fn unknown() -> Self {
        Self {
            node: UNKNOWN_ADDRESS,
            channel: UNKNOWN_ADDRESS,
            state: false,
        }
    }

    /// Whether this is the unknown sentinel
    pub fn is_unknown(&self) -> bool {
        self.node == UNKNOWN_ADDRESS && self.channel == UNKNOWN_ADDRESS
    }
}

/// Last known state of digital channels for one direction of traffic
pub struct DigitalChannels {
    table: Mutex<ChannelTable<bool>>,
    node_registry: Option<SharedNodeRegistry>,
    on_changed: Option<ChangeCallback<DigitalValue>>,
}

impl DigitalChannels {
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
    pub fn on_changed_value(mut self, callback: ChangeCallback<DigitalValue>) -> Self {
        self.on_changed = Some(callback);
        self
    }

    /// Last known state of a channel, or [`DigitalValue::unknown`]
    pub fn channel_data(&self, node: u8, channel: u16) -> DigitalValue {
        self.table
            .lock()
            .get(node, channel)
            .map(|state| DigitalValue::new(node, channel, *state))
            .unwrap_or_else(DigitalValue::unknown)
    }

    /// Write a channel and return the serialized page carrying it
    ///
    /// The value is stored unconditionally. The returned bytes are empty when
    /// the registry has no backing node registry.
    pub fn set_channel(&self, node: u8, channel: u16, state: bool) -> Result<Vec<u8>> {
        let (page, index) = digital_page_for_channel(channel)?;
        let bit = digital_bit_for_index(index);

        // Lock order: table, then node registry
        let mut table = self.table.lock();
        let bytes = match &self.node_registry {
            Some(registry) => {
                let mut registry = registry.lock();
                registry.update_digital_entry(node, page, bit, state)?;
                registry.page_bytes(node, page)?.to_vec()
            }
            None => Vec::new(),
        };

        table.store(node, channel, state);
        table.mark_written(node, page);
        debug!(node, channel, page, bit, state, "Digital channel set");

        Ok(bytes)
    }

    /// Apply an inbound page, notifying the change callback
    ///
    /// Returns the number of channels whose state changed. Analog messages
    /// are ignored.
    pub fn submit_message(&self, sender: IpAddr, message: &Message) -> usize {
        let Message::Digital(page) = message else {
            trace!(page = message.page(), "Ignoring analog page in digital registry");
            return 0;
        };

        let mut changed = Vec::new();
        {
            let mut table = self.table.lock();
            for (bit, state) in page.bits() {
                let channel = inbound_digital_channel(page.page, bit);
                let previous = table.store(page.node, channel, state);
                if previous != Some(state) {
                    changed.push(DigitalValue::new(page.node, channel, state));
                }
            }
        }

        if let Some(callback) = &self.on_changed {
            for value in &changed {
                trace!(node = value.node, channel = value.channel, state = value.state, "Digital channel changed");
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

    /// Number of channels with a known state
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether no channel has a known state
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DigitalChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DigitalChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalChannels")
            .field("channels", &self.len())
            .field("backed", &self.node_registry.is_some())
            .finish()
    }
}
