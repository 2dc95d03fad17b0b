//! CoE Protocol - CAN-over-Ethernet wire format
//!
//! This crate handles the pure, I/O-free part of the CoE protocol: the
//! measure type catalog and the translation between 14/15/22-byte UDP
//! payloads and typed [`Message`] values.

pub mod error;
pub mod measure;
pub mod message;

pub use error::{CodecError, Result};
pub use measure::MeasureType;
pub use message::{
    is_analog_page, is_digital_page, AnalogPage, AnalogSlot, CoeVersion, DigitalPage, Message,
    ANALOG_FRAME_LEN_V1, ANALOG_FRAME_LEN_V2, ANALOG_SLOTS, COE_PORT, DIGITAL_BITS,
    DIGITAL_FRAME_LEN, MIN_FRAME_LEN, PAGE_COUNT,
};
