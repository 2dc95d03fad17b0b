//! Error types for CoE bridge operations
//!
//! Decode and send failures are contained at the transport boundary: they
//! are logged and counted, never surfaced to the publishing side. Only
//! startup failures (bind, configuration) and invalid writes reach callers.

use std::net::{IpAddr, SocketAddr};

use coe_protocol::CodecError;
use thiserror::Error;

/// Main error type for CoE bridge operations
#[derive(Error, Debug)]
pub enum CoeError {
    // ===== Protocol Errors =====
    /// Datagram could not be decoded or a page could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Page serialization requested for a node that was never written
    #[error("Unknown CAN node: {0}")]
    UnknownNode(u8),

    /// Page number outside the node's ten pages
    #[error("Invalid page {page} for node {node}")]
    InvalidPage {
        /// CAN node id
        node: u8,
        /// Page number
        page: u8,
    },

    /// Channel number has no page/slot in the wire layout
    #[error("Channel {channel} is out of range for {kind} channels")]
    ChannelOutOfRange {
        /// Channel kind ("digital" or "analog")
        kind: &'static str,
        /// Requested channel number
        channel: u16,
    },

    // ===== Transport Errors =====
    /// UDP socket could not be bound
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        /// Requested bind address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Datagram could not be sent
    #[error("Failed to send datagram to {peer}: {reason}")]
    Send {
        /// Destination
        peer: SocketAddr,
        /// Failure reason
        reason: String,
    },

    // ===== Bridge Errors =====
    /// Write addressed to a peer that is not configured
    #[error("No CoE peer configured for {0}")]
    UnknownPeer(IpAddr),

    /// Bridge already started
    #[error("CoE bridge is already running")]
    BridgeAlreadyRunning,

    /// Bridge not started or already shut down
    #[error("CoE bridge is not running")]
    BridgeNotRunning,

    /// State publisher rejected an update
    #[error("Failed to publish update: {0}")]
    Publish(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoeError {
    /// Check if this error is transient
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoeError::Send { .. } | CoeError::Publish(_) | CoeError::Io(_)
        )
    }

    /// Check if this is a protocol error (bad data from a peer)
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, CoeError::Codec(CodecError::TruncatedMessage { .. }))
            || matches!(self, CoeError::Codec(CodecError::InvalidMessage { .. }))
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            CoeError::Codec(CodecError::TruncatedMessage { .. }) => "TRUNCATED_MESSAGE",
            CoeError::Codec(CodecError::InvalidMessage { .. }) => "INVALID_MESSAGE",
            CoeError::Codec(CodecError::ValueOutOfRange { .. }) => "VALUE_OUT_OF_RANGE",
            CoeError::UnknownNode(_) => "UNKNOWN_NODE",
            CoeError::InvalidPage { .. } => "INVALID_PAGE",
            CoeError::ChannelOutOfRange { .. } => "CHANNEL_OUT_OF_RANGE",
            CoeError::Bind { .. } => "BIND_ERROR",
            CoeError::Send { .. } => "SEND_ERROR",
            CoeError::UnknownPeer(_) => "UNKNOWN_PEER",
            CoeError::BridgeAlreadyRunning => "BRIDGE_ALREADY_RUNNING",
            CoeError::BridgeNotRunning => "BRIDGE_NOT_RUNNING",
            CoeError::Publish(_) => "PUBLISH_ERROR",
            CoeError::InvalidConfig(_) => "INVALID_CONFIG",
            CoeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for CoE bridge operations
pub type Result<T> = std::result::Result<T, CoeError>;
