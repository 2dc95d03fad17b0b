//! UDP transport for CoE datagrams
//!
//! - [`UdpReceiver`] - one bound socket and a receive task feeding a [`DatagramHandler`]
//! - [`UdpSender`] - fire-and-forget sends to one fixed CMI peer
//!
//! Neither side surfaces per-datagram failures to callers. They are logged
//! and counted so a misbehaving peer cannot stall the bridge.

mod receiver;
mod sender;

pub use receiver::UdpReceiver;
pub use sender::UdpSender;

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Consumer of raw datagrams read by a [`UdpReceiver`]
///
/// Errors returned here are logged by the receive task and otherwise
/// ignored; the task keeps reading.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    /// Handle one datagram received from `from`
    async fn on_datagram(&self, data: &[u8], from: SocketAddr) -> Result<()>;
}

/// Unspecified local address of the same family as `peer`
fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
