//! Send side of the UDP transport

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use super::unspecified_for;
use crate::error::{CoeError, Result};
use crate::node_registry::SharedNodeRegistry;

/// Sends pages of one node registry to one CMI peer
pub struct UdpSender {
    socket: UdpSocket,
    peer: SocketAddr,
    node_registry: SharedNodeRegistry,
    sent: AtomicU64,
    send_failures: AtomicU64,
}

impl UdpSender {
    /// Bind an ephemeral local socket targeting `peer`
    pub async fn bind(peer: SocketAddr, node_registry: SharedNodeRegistry) -> Result<Self> {
        let local = unspecified_for(&peer);
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| CoeError::Bind {
                addr: local,
                source,
            })?;
        debug!("CoE sender for {} bound to {}", peer, socket.local_addr()?);

        Ok(Self {
            socket,
            peer,
            node_registry,
            sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        })
    }

    /// Destination of every datagram
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Node registry whose pages this sender transmits
    pub fn node_registry(&self) -> &SharedNodeRegistry {
        &self.node_registry
    }

    /// Send one datagram
    ///
    /// Failures are logged and counted. Returns whether the datagram was
    /// handed to the socket.
    pub async fn send_bytes(&self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        match self.socket.send_to(payload, self.peer).await {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                trace!(peer = %self.peer, len = payload.len(), "Datagram sent");
                true
            }
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                let err = CoeError::Send {
                    peer: self.peer,
                    reason: e.to_string(),
                };
                warn!(code = err.error_code(), "{}", err);
                false
            }
        }
    }

    /// Send every written page of the node registry, one datagram each
    ///
    /// Returns the number of datagrams handed to the socket.
    pub async fn send_all_channels(&self) -> usize {
        let pages = self.node_registry.lock().bytes_for_all_written_pages();
        let mut sent = 0;
        for page in &pages {
            if self.send_bytes(page).await {
                sent += 1;
            }
        }
        debug!(peer = %self.peer, pages = pages.len(), sent, "Resent written pages");
        sent
    }

    /// Datagrams handed to the socket so far
    pub fn datagrams_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Sends that failed
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for UdpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSender")
            .field("peer", &self.peer)
            .field("sent", &self.datagrams_sent())
            .field("send_failures", &self.send_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_registry::CanNodeRegistry;
    use coe_protocol::{CoeVersion, MeasureType};
    use std::time::Duration;

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn test_send_bytes_reaches_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSender::bind(
            peer.local_addr().unwrap(),
            CanNodeRegistry::shared(CoeVersion::V1),
        )
        .await
        .unwrap();

        assert!(sender.send_bytes(&[5, 0, 0x80, 0]).await);
        assert_eq!(recv(&peer).await, vec![5, 0, 0x80, 0]);
        assert_eq!(sender.datagrams_sent(), 1);
        assert_eq!(sender.send_failures(), 0);
    }

    #[tokio::test]
    async fn test_empty_payload_not_sent() {
        let sender = UdpSender::bind(
            "127.0.0.1:9".parse().unwrap(),
            CanNodeRegistry::shared(CoeVersion::V1),
        )
        .await
        .unwrap();
        assert!(!sender.send_bytes(&[]).await);
        assert_eq!(sender.datagrams_sent(), 0);
    }

    #[tokio::test]
    async fn test_send_all_channels() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let registry = CanNodeRegistry::shared(CoeVersion::V1);
        {
            let mut registry = registry.lock();
            registry.update_digital_entry(2, 0, 0, true).unwrap();
            registry
                .update_analog_entry(2, 1, 0, 20.0, MeasureType::Temperature)
                .unwrap();
        }
        let sender = UdpSender::bind(peer.local_addr().unwrap(), registry)
            .await
            .unwrap();

        assert_eq!(sender.send_all_channels().await, 2);
        let first = recv(&peer).await;
        let second = recv(&peer).await;
        assert_eq!(&first[..3], &[2, 0, 0x80]);
        assert_eq!(first.len(), 15);
        assert_eq!(&second[..2], &[2, 1]);
        assert_eq!(second.len(), 14);

        // Written pages stay dirty
        assert_eq!(sender.send_all_channels().await, 2);
    }

    #[tokio::test]
    async fn test_nothing_written_sends_nothing() {
        let sender = UdpSender::bind(
            "127.0.0.1:9".parse().unwrap(),
            CanNodeRegistry::shared(CoeVersion::V1),
        )
        .await
        .unwrap();
        assert_eq!(sender.send_all_channels().await, 0);
    }
}
