//! Channel registries
//!
//! A channel registry is the authoritative "last known value" store for one
//! direction of traffic. Two variants exist:
//!
//! - [`DigitalChannels`] - boolean channels carried on pages 0 and 9
//! - [`AnalogChannels`] - scaled values carried on pages 1..=8
//!
//! An outbound registry is backed by a [`CanNodeRegistry`](crate::node_registry::CanNodeRegistry)
//! and returns the serialized page for every write. A receive-only registry
//! has no backing node registry; writes still update its values but return
//! no bytes.
//!
//! # Addressing
//!
//! The inbound and outbound channel numbering are not symmetric and both are
//! kept exactly as the CMI side expects them:
//!
//! | Direction | Digital | Analog |
//! |-----------|---------|--------|
//! | outbound (`set_channel`) | `0..=15` → page 0, index `channel`; `16..=31` → page 9, index `channel - 15` | page `ceil(channel / 4)`, index `channel % 4` |
//! | inbound (`submit_message`) | `channel = page * 4 + bit` | `channel = (page - 1) * 4 + slot + 1` |
//!
//! Outbound page indices are 1-based: index `n` lands on bit (or slot)
//! `n - 1` of the page and index 0 wraps around to the last bit (or slot).
//! For analog channels this makes `set_channel(node, c)` and an inbound
//! report of channel `c` address the same slot.

mod analog;
mod digital;

pub use analog::{AnalogChannels, AnalogValue};
pub use digital::{DigitalChannels, DigitalValue};

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use coe_protocol::{ANALOG_SLOTS, DIGITAL_BITS};

use crate::error::{CoeError, Result};

/// Callback invoked with the sender address and the new value of a channel
/// whose value changed (or was seen for the first time)
pub type ChangeCallback<V> = Arc<dyn Fn(IpAddr, V) + Send + Sync>;

/// Node and channel number of the unknown-value sentinel
pub const UNKNOWN_ADDRESS: i32 = -1;

/// Analog value of the unknown-value sentinel
pub const UNKNOWN_ANALOG_VALUE: f64 = -9999.0;

/// Highest outbound digital channel
pub const MAX_DIGITAL_CHANNEL: u16 = 31;

/// Highest outbound analog channel
pub const MAX_ANALOG_CHANNEL: u16 = 32;

/// Page and page index of an outbound digital channel
pub fn digital_page_for_channel(channel: u16) -> Result<(u8, usize)> {
    if channel > MAX_DIGITAL_CHANNEL {
        return Err(CoeError::ChannelOutOfRange {
            kind: "digital",
            channel,
        });
    }
    if channel < DIGITAL_BITS as u16 {
        Ok((0, usize::from(channel)))
    } else {
        Ok((9, usize::from(channel) - 15))
    }
}

/// Bit position of a 1-based digital page index
pub fn digital_bit_for_index(index: usize) -> usize {
    (index + DIGITAL_BITS - 1) % DIGITAL_BITS
}

/// Slot position of a 1-based analog page index
pub fn analog_slot_for_index(index: usize) -> usize {
    (index + ANALOG_SLOTS - 1) % ANALOG_SLOTS
}

/// Page and page index of an outbound analog channel
pub fn analog_page_for_channel(channel: u16) -> Result<(u8, usize)> {
    if channel == 0 || channel > MAX_ANALOG_CHANNEL {
        return Err(CoeError::ChannelOutOfRange {
            kind: "analog",
            channel,
        });
    }
    let page = channel.div_ceil(ANALOG_SLOTS as u16) as u8;
    let index = usize::from(channel) % ANALOG_SLOTS;
    Ok((page, index))
}

/// Channel number of a bit in an inbound digital page
pub fn inbound_digital_channel(page: u8, bit: usize) -> u16 {
    u16::from(page) * 4 + bit as u16
}

/// Channel number of a slot in an inbound analog page
pub fn inbound_analog_channel(page: u8, slot: usize) -> u16 {
    (u16::from(page) - 1) * ANALOG_SLOTS as u16 + slot as u16 + 1
}

/// Value map and written pages shared by both registry variants
#[derive(Debug)]
struct ChannelTable<V> {
    values: HashMap<(u8, u16), V>,
    written: BTreeSet<(u8, u8)>,
}

impl<V> ChannelTable<V> {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            written: BTreeSet::new(),
        }
    }

    fn get(&self, node: u8, channel: u16) -> Option<&V> {
        self.values.get(&(node, channel))
    }

    /// Store a value, returning the previous one
    fn store(&mut self, node: u8, channel: u16, value: V) -> Option<V> {
        self.values.insert((node, channel), value)
    }

    fn mark_written(&mut self, node: u8, page: u8) {
        self.written.insert((node, page));
    }

    fn written_pages(&self) -> Vec<(u8, u8)> {
        self.written.iter().copied().collect()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digital_outbound_addressing() {
        assert_eq!(digital_page_for_channel(0).unwrap(), (0, 0));
        assert_eq!(digital_page_for_channel(2).unwrap(), (0, 2));
        assert_eq!(digital_page_for_channel(15).unwrap(), (0, 15));
        assert_eq!(digital_page_for_channel(16).unwrap(), (9, 1));
        assert_eq!(digital_page_for_channel(31).unwrap(), (9, 16));
        assert!(matches!(
            digital_page_for_channel(32),
            Err(CoeError::ChannelOutOfRange { channel: 32, .. })
        ));
    }

    #[test]
    fn test_digital_bit_positions() {
        assert_eq!(digital_bit_for_index(1), 0);
        assert_eq!(digital_bit_for_index(3), 2);
        assert_eq!(digital_bit_for_index(16), 15);
        assert_eq!(digital_bit_for_index(0), 15);
    }

    #[test]
    fn test_analog_outbound_addressing() {
        assert_eq!(analog_page_for_channel(1).unwrap(), (1, 1));
        assert_eq!(analog_page_for_channel(3).unwrap(), (1, 3));
        assert_eq!(analog_page_for_channel(4).unwrap(), (1, 0));
        assert_eq!(analog_page_for_channel(5).unwrap(), (2, 1));
        assert_eq!(analog_page_for_channel(32).unwrap(), (8, 0));
        assert!(analog_page_for_channel(0).is_err());
        assert!(analog_page_for_channel(33).is_err());
    }

    #[test]
    fn test_analog_slot_positions_match_inbound() {
        for channel in 1..=MAX_ANALOG_CHANNEL {
            let (page, index) = analog_page_for_channel(channel).unwrap();
            let slot = analog_slot_for_index(index);
            assert_eq!(inbound_analog_channel(page, slot), channel);
        }
    }

    #[test]
    fn test_inbound_addressing() {
        assert_eq!(inbound_analog_channel(1, 0), 1);
        assert_eq!(inbound_analog_channel(2, 0), 5);
        assert_eq!(inbound_analog_channel(8, 3), 32);

        // Stride 4 on the inbound digital path
        assert_eq!(inbound_digital_channel(0, 0), 0);
        assert_eq!(inbound_digital_channel(0, 15), 15);
        assert_eq!(inbound_digital_channel(9, 0), 36);
        assert_eq!(inbound_digital_channel(9, 15), 51);
    }
}
