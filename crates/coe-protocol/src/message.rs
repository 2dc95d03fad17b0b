//! CoE datagram codec
//!
//! One UDP datagram carries exactly one page of one CAN node:
//!
//! ```text
//! Offset 0   node id (u8)
//! Offset 1   page number (u8): 0 or 9 => digital, 1..=8 => analog
//!
//! digital:   2-3    16 packed bits, MSB first within each byte
//!            4-14   zero padding
//! analog v1: 2-9    four i16 LE scaled values
//!            10-13  four measure codes
//! analog v2: 2-17   four i32 LE scaled values
//!            18-21  four measure codes
//! ```
//!
//! The protocol version is not carried on the wire. Both ends must agree on
//! it out of band.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CodecError, Result};
use crate::measure::MeasureType;

/// Default UDP port of CoE peers
pub const COE_PORT: u16 = 5441;

/// Smallest datagram accepted by the decoder
pub const MIN_FRAME_LEN: usize = 14;

/// Length of an encoded digital frame (header, bits, 11 bytes padding)
pub const DIGITAL_FRAME_LEN: usize = 15;

/// Length of an encoded analog frame with 16-bit values
pub const ANALOG_FRAME_LEN_V1: usize = 14;

/// Length of an encoded analog frame with 32-bit values
pub const ANALOG_FRAME_LEN_V2: usize = 22;

/// Number of pages per node
pub const PAGE_COUNT: u8 = 10;

/// Slots per analog page
pub const ANALOG_SLOTS: usize = 4;

/// Bits per digital page
pub const DIGITAL_BITS: usize = 16;

const HEADER_LEN: usize = 2;
const DIGITAL_PADDING: usize = DIGITAL_FRAME_LEN - HEADER_LEN - 2;

/// Width of the analog value fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoeVersion {
    /// Little-endian i16 values
    #[default]
    V1,
    /// Little-endian i32 values
    V2,
}

impl CoeVersion {
    /// Length of an analog frame in this version
    pub fn analog_frame_len(&self) -> usize {
        match self {
            CoeVersion::V1 => ANALOG_FRAME_LEN_V1,
            CoeVersion::V2 => ANALOG_FRAME_LEN_V2,
        }
    }

    /// Receive buffer needed to hold a full analog frame
    pub fn receive_buffer_len(&self) -> usize {
        self.analog_frame_len().max(MIN_FRAME_LEN)
    }

    fn value_range(&self) -> (i64, i64) {
        match self {
            CoeVersion::V1 => (i64::from(i16::MIN), i64::from(i16::MAX)),
            CoeVersion::V2 => (i64::from(i32::MIN), i64::from(i32::MAX)),
        }
    }

    /// Check that a physical value fits this version's integer width
    pub fn check_value(&self, value: f64, measure: MeasureType) -> Result<i64> {
        let raw = measure.to_wire(value);
        let (min, max) = self.value_range();
        if !value.is_finite() || raw < min || raw > max {
            return Err(CodecError::ValueOutOfRange {
                value,
                measure,
                version: *self,
            });
        }
        Ok(raw)
    }
}

impl fmt::Display for CoeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoeVersion::V1 => write!(f, "v1"),
            CoeVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Whether a page number selects digital framing
pub fn is_digital_page(page: u8) -> bool {
    page == 0 || page == 9
}

/// Whether a page number selects analog framing
pub fn is_analog_page(page: u8) -> bool {
    (1..=8).contains(&page)
}

/// One analog slot: physical value and its measure type
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnalogSlot {
    /// Physical value
    pub value: f64,
    /// Measure type (scale and unit)
    pub measure: MeasureType,
}

impl AnalogSlot {
    /// Create a slot
    pub fn new(value: f64, measure: MeasureType) -> Self {
        Self { value, measure }
    }
}

/// Content of an analog page (pages 1..=8)
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPage {
    /// CAN node id
    pub node: u8,
    /// Page number
    pub page: u8,
    /// The four slots
    pub slots: [AnalogSlot; ANALOG_SLOTS],
}

impl AnalogPage {
    /// Create an empty analog page
    pub fn new(node: u8, page: u8) -> Self {
        Self {
            node,
            page,
            slots: [AnalogSlot::default(); ANALOG_SLOTS],
        }
    }

    /// Slots carrying a physical value, with their index
    ///
    /// Slots tagged [`MeasureType::None`] are skipped.
    pub fn changes(&self) -> impl Iterator<Item = (usize, AnalogSlot)> + '_ {
        self.slots
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, slot)| !slot.measure.is_none())
    }
}

/// Content of a digital page (pages 0 and 9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitalPage {
    /// CAN node id
    pub node: u8,
    /// Page number
    pub page: u8,
    /// 16 bit states, index 0 is the MSB of the first byte
    pub bits: [bool; DIGITAL_BITS],
}

impl DigitalPage {
    /// Create a digital page with all bits cleared
    pub fn new(node: u8, page: u8) -> Self {
        Self {
            node,
            page,
            bits: [false; DIGITAL_BITS],
        }
    }

    /// Bit states in wire order
    pub fn bits(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.bits.iter().copied().enumerate()
    }

    fn pack(&self) -> [u8; 2] {
        let mut packed = [0u8; 2];
        for (index, state) in self.bits() {
            if state {
                packed[index / 8] |= 0x80 >> (index % 8);
            }
        }
        packed
    }

    fn unpack(node: u8, page: u8, packed: [u8; 2]) -> Self {
        let mut bits = [false; DIGITAL_BITS];
        for (index, bit) in bits.iter_mut().enumerate() {
            *bit = packed[index / 8] & (0x80 >> (index % 8)) != 0;
        }
        Self { node, page, bits }
    }
}

/// A decoded CoE datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Analog page (1..=8)
    Analog(AnalogPage),
    /// Digital page (0 or 9)
    Digital(DigitalPage),
}

impl Message {
    /// CAN node id
    pub fn node(&self) -> u8 {
        match self {
            Message::Analog(page) => page.node,
            Message::Digital(page) => page.node,
        }
    }

    /// Page number
    pub fn page(&self) -> u8 {
        match self {
            Message::Analog(page) => page.page,
            Message::Digital(page) => page.page,
        }
    }

    /// Decode a datagram
    pub fn decode(data: &[u8], version: CoeVersion) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(CodecError::TruncatedMessage {
                len: data.len(),
                needed: MIN_FRAME_LEN,
            });
        }

        let mut buf = data;
        let node = buf.get_u8();
        let page = buf.get_u8();

        if is_digital_page(page) {
            let packed = [buf.get_u8(), buf.get_u8()];
            return Ok(Message::Digital(DigitalPage::unpack(node, page, packed)));
        }

        if !is_analog_page(page) {
            return Err(CodecError::InvalidMessage { page });
        }

        let needed = version.analog_frame_len();
        if data.len() < needed {
            return Err(CodecError::TruncatedMessage {
                len: data.len(),
                needed,
            });
        }

        let mut raw = [0i64; ANALOG_SLOTS];
        for value in raw.iter_mut() {
            *value = match version {
                CoeVersion::V1 => i64::from(buf.get_i16_le()),
                CoeVersion::V2 => i64::from(buf.get_i32_le()),
            };
        }

        let mut analog = AnalogPage::new(node, page);
        for (slot, raw) in analog.slots.iter_mut().zip(raw) {
            let measure = MeasureType::from_code(buf.get_u8());
            *slot = AnalogSlot::new(measure.from_wire(raw), measure);
        }

        Ok(Message::Analog(analog))
    }

    /// Encode into a datagram
    pub fn encode(&self, version: CoeVersion) -> Result<Bytes> {
        match self {
            Message::Digital(digital) => {
                if !is_digital_page(digital.page) {
                    return Err(CodecError::InvalidMessage { page: digital.page });
                }
                let mut buf = BytesMut::with_capacity(DIGITAL_FRAME_LEN);
                buf.put_u8(digital.node);
                buf.put_u8(digital.page);
                buf.put_slice(&digital.pack());
                buf.put_bytes(0, DIGITAL_PADDING);
                Ok(buf.freeze())
            }
            Message::Analog(analog) => {
                if !is_analog_page(analog.page) {
                    return Err(CodecError::InvalidMessage { page: analog.page });
                }
                let mut buf = BytesMut::with_capacity(version.analog_frame_len());
                buf.put_u8(analog.node);
                buf.put_u8(analog.page);
                for slot in &analog.slots {
                    let raw = version.check_value(slot.value, slot.measure)?;
                    // check_value bounds raw to the version's width
                    match version {
                        CoeVersion::V1 => buf.put_i16_le(raw as i16),
                        CoeVersion::V2 => buf.put_i32_le(raw as i32),
                    }
                }
                for slot in &analog.slots {
                    buf.put_u8(slot.measure.code());
                }
                Ok(buf.freeze())
            }
        }
    }
}
