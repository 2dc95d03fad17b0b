//! Receive side of the UDP transport

use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::DatagramHandler;
use crate::error::{CoeError, Result};

#[derive(Debug, Default)]
struct ReceiverCounters {
    datagrams: AtomicU64,
    handler_errors: AtomicU64,
    socket_errors: AtomicU64,
}

/// A bound UDP socket with its receive task
pub struct UdpReceiver {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    counters: Arc<ReceiverCounters>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpReceiver {
    /// Bind `bind_addr` and start handing datagrams to `handler`
    ///
    /// Datagrams longer than `buffer_len` are truncated to it.
    pub async fn start(
        bind_addr: SocketAddr,
        buffer_len: usize,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| CoeError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(ReceiverCounters::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(receive_loop(
            socket,
            buffer_len,
            handler,
            shutdown_rx,
            running.clone(),
            counters.clone(),
        ));

        info!("CoE receiver listening on {}", local_addr);

        Ok(Self {
            local_addr,
            running,
            counters,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the receive task is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Datagrams read from the socket so far
    pub fn datagrams_received(&self) -> u64 {
        self.counters.datagrams.load(Ordering::Relaxed)
    }

    /// Datagrams the handler rejected
    pub fn handler_errors(&self) -> u64 {
        self.counters.handler_errors.load(Ordering::Relaxed)
    }

    /// Failed socket reads
    pub fn socket_errors(&self) -> u64 {
        self.counters.socket_errors.load(Ordering::Relaxed)
    }

    /// Stop the receive task and wait for it to finish
    ///
    /// Only the first call does any work. Must not be awaited from inside
    /// the handler, which runs on the receive task itself.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("CoE receive task ended abnormally: {}", e);
            }
            info!("CoE receiver on {} stopped", self.local_addr);
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for UdpReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpReceiver")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .field("datagrams_received", &self.datagrams_received())
            .finish()
    }
}

/// Whether a receive error leaves the socket usable
///
/// ICMP errors for earlier sends surface as reset/refused on some platforms.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

async fn receive_loop(
    socket: UdpSocket,
    buffer_len: usize,
    handler: Arc<dyn DatagramHandler>,
    mut shutdown_rx: oneshot::Receiver<()>,
    running: Arc<AtomicBool>,
    counters: Arc<ReceiverCounters>,
) {
    let mut buf = vec![0u8; buffer_len];
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!("CoE receive task shutting down");
                break;
            }

            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    counters.datagrams.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = handler.on_datagram(&buf[..len], from).await {
                        counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                        if e.is_protocol_error() {
                            debug!(code = e.error_code(), "Dropping datagram from {}: {}", from, e);
                        } else {
                            warn!(code = e.error_code(), "Failed to handle datagram from {}: {}", from, e);
                        }
                    }
                }
                Err(e) if is_transient(&e) => {
                    counters.socket_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("CoE receive error: {}", e);
                }
                Err(e) => {
                    counters.socket_errors.fetch_add(1, Ordering::Relaxed);
                    error!("CoE receive socket failed, stopping receiver: {}", e);
                    break;
                }
            }
        }
    }
    running.store(false, Ordering::Release);
}
