//! Codec error types

use thiserror::Error;

use crate::measure::MeasureType;
use crate::message::CoeVersion;

/// Errors raised while decoding or encoding CoE datagrams
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Datagram shorter than the frame it claims to be
    #[error("Truncated message: {len} bytes, need at least {needed}")]
    TruncatedMessage {
        /// Received length
        len: usize,
        /// Required length
        needed: usize,
    },

    /// Page number outside 0..=9, or framing that does not match the page
    #[error("Invalid message: page number {page} is not a CoE page")]
    InvalidMessage {
        /// Offending page number
        page: u8,
    },

    /// Scaled value does not fit the analog field width
    #[error("Value {value} ({measure}) does not fit a {version} analog field")]
    ValueOutOfRange {
        /// Physical value
        value: f64,
        /// Measure type used for scaling
        measure: MeasureType,
        /// Protocol version selecting the field width
        version: CoeVersion,
    },
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;
