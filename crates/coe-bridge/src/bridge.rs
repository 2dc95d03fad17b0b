//! CoeBridge - CMI integration service
//!
//! This module provides the main bridge service between CMI devices speaking
//! CoE over UDP and a home automation state publisher. It handles:
//!
//! - CMI → publisher: decoding inbound pages and publishing changed channels
//! - caller → CMI: channel writes that are sent immediately and resent
//!   periodically for the lifetime of the bridge
//! - availability: reporting configured CMIs online or offline
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           CoeBridge                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌─────────────┐   ┌────────────────┐   ┌───────────────────┐   │
//! │  │ UdpReceiver │──►│ InboundPath    │──►│ event queue       │   │
//! │  │ (listen)    │   │ per-node regs  │   │  └► pump task ──► │──►│ StatePublisher
//! │  └─────────────┘   │ Liveness       │   └───────────────────┘   │
//! │                    └────────────────┘                            │
//! │                                                                  │
//! │  write_switch / write_number                                     │
//! │     └► OutboundPeer: registries ─► CanNodeRegistry ─► UdpSender ─┼──► CMI
//! │                                          ▲                       │
//! │  Scheduler: resend (per peer), availability check                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use coe_bridge::{BridgeConfig, CoeBridge};
//!
//! let bridge = CoeBridge::new(BridgeConfig::from_json_file("coe.json")?, publisher).await?;
//! bridge.start().await?;
//!
//! bridge.write_switch(cmi, 30, 3, true).await?;
//!
//! bridge.shutdown().await;
//! ```

use async_trait::async_trait;
use chrono::Utc;
use coe_protocol::{MeasureType, Message};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BridgeConfig, PeerConfig};
use crate::error::{CoeError, Result};
use crate::liveness::{LivenessTracker, PeerStatus};
use crate::node_registry::CanNodeRegistry;
use crate::registry::{AnalogChannels, AnalogValue, ChangeCallback, DigitalChannels, DigitalValue};
use crate::scheduler::Scheduler;
use crate::transport::{DatagramHandler, UdpReceiver, UdpSender};

/// Consumer of channel updates and device availability
///
/// Implemented by the MQTT side of an installation. Calls are made from a
/// single pump task, one at a time, in the order the updates were observed.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    /// An analog channel reported by `source` changed
    async fn publish_sensor_update(&self, source: IpAddr, value: AnalogValue) -> Result<()>;

    /// A digital channel reported by `source` changed
    async fn publish_binary_update(&self, source: IpAddr, value: DigitalValue) -> Result<()>;

    /// Availability of a configured CMI
    async fn publish_device_availability(&self, peer: IpAddr, online: bool) -> Result<()>;
}

/// A change waiting to be published
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Analog channel changed
    Sensor {
        /// CMI that reported it
        source: IpAddr,
        /// New value
        value: AnalogValue,
    },
    /// Digital channel changed
    Binary {
        /// CMI that reported it
        source: IpAddr,
        /// New state
        value: DigitalValue,
    },
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Datagrams read from the listen socket
    pub datagrams_received: u64,
    /// Datagrams dropped because they could not be decoded
    pub decode_errors: u64,
    /// Analog channel changes observed
    pub analog_updates: u64,
    /// Digital channel changes observed
    pub digital_updates: u64,
    /// Updates delivered to the publisher
    pub events_published: u64,
    /// Updates dropped because the publication queue was full
    pub events_dropped: u64,
    /// Updates the publisher rejected
    pub publish_errors: u64,
    /// Datagrams sent to CMI peers
    pub datagrams_sent: u64,
    /// Datagrams that failed to send
    pub send_failures: u64,
    /// Periodic resend rounds completed
    pub resends: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    datagrams_received: AtomicU64,
    decode_errors: AtomicU64,
    analog_updates: AtomicU64,
    digital_updates: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    publish_errors: AtomicU64,
    resends: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Inbound registries of one remote CAN node
#[derive(Debug)]
struct InboundNode {
    analog: AnalogChannels,
    digital: DigitalChannels,
}

/// Receive path: decodes datagrams and feeds the inbound registries
struct InboundPath {
    config: Arc<BridgeConfig>,
    liveness: Arc<LivenessTracker>,
    nodes: Mutex<BTreeMap<u8, Arc<InboundNode>>>,
    event_tx: mpsc::Sender<ChannelEvent>,
    stats: Arc<StatsCounters>,
}

impl InboundPath {
    fn lookup(&self, node: u8) -> Option<Arc<InboundNode>> {
        self.nodes.lock().get(&node).cloned()
    }

    fn node(&self, node: u8) -> Arc<InboundNode> {
        self.nodes
            .lock()
            .entry(node)
            .or_insert_with(|| Arc::new(self.create_node(node)))
            .clone()
    }

    fn create_node(&self, node: u8) -> InboundNode {
        let tx = self.event_tx.clone();
        let stats = self.stats.clone();
        let on_analog: ChangeCallback<AnalogValue> = Arc::new(move |source, value| {
            bump(&stats.analog_updates);
            enqueue(&tx, &stats, ChannelEvent::Sensor { source, value });
        });

        let tx = self.event_tx.clone();
        let stats = self.stats.clone();
        let on_digital: ChangeCallback<DigitalValue> = Arc::new(move |source, value| {
            bump(&stats.digital_updates);
            enqueue(&tx, &stats, ChannelEvent::Binary { source, value });
        });

        debug!(node, "Created inbound registries for CAN node");
        InboundNode {
            analog: AnalogChannels::new().on_changed_value(on_analog),
            digital: DigitalChannels::new().on_changed_value(on_digital),
        }
    }
}

#[async_trait]
impl DatagramHandler for InboundPath {
    async fn on_datagram(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        bump(&self.stats.datagrams_received);
        let sender = from.ip();
        self.liveness.touch(sender, Utc::now());

        let message = Message::decode(data, self.config.version_for(sender)).map_err(|e| {
            bump(&self.stats.decode_errors);
            CoeError::from(e)
        })?;

        let node = self.node(message.node());
        let changed = match &message {
            Message::Analog(_) => node.analog.submit_message(sender, &message),
            Message::Digital(_) => node.digital.submit_message(sender, &message),
        };
        debug!(
            %sender,
            node = message.node(),
            page = message.page(),
            changed,
            "CoE page received"
        );
        Ok(())
    }
}

fn enqueue(tx: &mpsc::Sender<ChannelEvent>, stats: &StatsCounters, event: ChannelEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            bump(&stats.events_dropped);
            warn!("Publication queue full, dropping {:?}", event);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("Publication queue closed");
        }
    }
}

/// Outbound state of one configured CMI
struct OutboundPeer {
    config: PeerConfig,
    digital: DigitalChannels,
    analog: AnalogChannels,
    sender: UdpSender,
}

impl OutboundPeer {
    async fn resend(&self, stats: &StatsCounters) -> usize {
        let sent = self.sender.send_all_channels().await;
        bump(&stats.resends);
        debug!(peer = %self.config.name, sent, "Periodic resend");
        sent
    }
}

/// Tasks that exist only while the bridge is started
struct Running {
    receiver: UdpReceiver,
    pump_stop: oneshot::Sender<()>,
    pump: JoinHandle<mpsc::Receiver<ChannelEvent>>,
}

/// Main bridge service connecting CMI devices to a state publisher
pub struct CoeBridge {
    config: Arc<BridgeConfig>,
    publisher: Arc<dyn StatePublisher>,
    inbound: Arc<InboundPath>,
    peers: BTreeMap<IpAddr, Arc<OutboundPeer>>,
    liveness: Arc<LivenessTracker>,
    scheduler: Scheduler,
    stats: Arc<StatsCounters>,
    event_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    running: Mutex<Option<Running>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl CoeBridge {
    /// Create a bridge for `config`, publishing to `publisher`
    ///
    /// Binds one send socket per configured peer. Nothing is received or
    /// published until [`start`](Self::start) is called.
    pub async fn new(
        config: BridgeConfig,
        publisher: Arc<dyn StatePublisher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let stats = Arc::new(StatsCounters::default());
        let liveness = Arc::new(LivenessTracker::new(config.offline_after));

        let mut peers = BTreeMap::new();
        for peer in &config.peers {
            liveness.track(peer.address);
            let node_registry = CanNodeRegistry::shared(peer.version);
            let sender = UdpSender::bind(peer.socket_addr(), node_registry.clone()).await?;
            peers.insert(
                peer.address,
                Arc::new(OutboundPeer {
                    config: peer.clone(),
                    digital: DigitalChannels::with_node_registry(node_registry.clone()),
                    analog: AnalogChannels::with_node_registry(node_registry),
                    sender,
                }),
            );
        }

        let (event_tx, event_rx) = mpsc::channel(config.event_queue_size);
        let inbound = Arc::new(InboundPath {
            config: config.clone(),
            liveness: liveness.clone(),
            nodes: Mutex::new(BTreeMap::new()),
            event_tx,
            stats: stats.clone(),
        });

        Ok(Arc::new(Self {
            config,
            publisher,
            inbound,
            peers,
            liveness,
            scheduler: Scheduler::new(),
            stats,
            event_rx: Mutex::new(Some(event_rx)),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }

    /// Bind the listen socket and start the pump and periodic jobs
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(CoeError::BridgeAlreadyRunning);
        }
        let Some(event_rx) = self.event_rx.lock().take() else {
            error!("Publication queue lost by a previous shutdown, cannot start");
            return Err(CoeError::BridgeNotRunning);
        };

        let handler: Arc<dyn DatagramHandler> = self.inbound.clone();
        let receiver = match UdpReceiver::start(
            self.config.listen_addr,
            self.config.receive_buffer_len(),
            handler,
        )
        .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                *self.event_rx.lock() = Some(event_rx);
                return Err(e);
            }
        };

        let (pump_stop, stop_rx) = oneshot::channel();
        let pump = tokio::spawn(run_pump(
            event_rx,
            stop_rx,
            self.publisher.clone(),
            self.stats.clone(),
        ));

        for peer in self.peers.values() {
            let peer = peer.clone();
            let stats = self.stats.clone();
            self.scheduler
                .schedule_every(self.config.resend_interval, move || {
                    let peer = peer.clone();
                    let stats = stats.clone();
                    async move {
                        peer.resend(&stats).await;
                    }
                    .boxed()
                });
        }

        let liveness = self.liveness.clone();
        let publisher = self.publisher.clone();
        let stats = self.stats.clone();
        self.scheduler
            .schedule_every(self.config.availability_interval, move || {
                let liveness = liveness.clone();
                let publisher = publisher.clone();
                let stats = stats.clone();
                async move {
                    publish_statuses(&liveness, publisher.as_ref(), &stats).await;
                }
                .boxed()
            });

        info!(
            "CoE bridge started on {} with {} peer(s)",
            receiver.local_addr(),
            self.peers.len()
        );
        *self.running.lock() = Some(Running {
            receiver,
            pump_stop,
            pump,
        });
        Ok(())
    }

    /// Stop the periodic jobs, the receiver and the pump
    ///
    /// Updates already queued are published before this returns. Calling it
    /// on a bridge that is not running does nothing. A stopped bridge can be
    /// started again; its registries keep their contents.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.running.lock().take() else {
            return;
        };

        self.scheduler.cancel_all().await;
        running.receiver.shutdown().await;

        let _ = running.pump_stop.send(());
        match running.pump.await {
            Ok(event_rx) => *self.event_rx.lock() = Some(event_rx),
            Err(e) => warn!("Publication pump ended abnormally: {}", e),
        }

        info!("CoE bridge stopped");
    }

    /// Whether the bridge is started
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Address of the listen socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.receiver.local_addr())
            .ok_or(CoeError::BridgeNotRunning)
    }

    /// Configuration the bridge was created with
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Set a digital channel on a CMI and send its page
    ///
    /// Returns the page bytes that were sent.
    pub async fn write_switch(
        &self,
        peer: IpAddr,
        node: u8,
        channel: u16,
        state: bool,
    ) -> Result<Vec<u8>> {
        let target = self.peer(peer)?;
        let bytes = target.digital.set_channel(node, channel, state)?;
        target.sender.send_bytes(&bytes).await;
        debug!(peer = %target.config.name, node, channel, state, "Switch written");
        Ok(bytes)
    }

    /// Set an analog channel on a CMI and send its page
    ///
    /// Returns the page bytes that were sent.
    pub async fn write_number(
        &self,
        peer: IpAddr,
        node: u8,
        channel: u16,
        value: f64,
        measure: MeasureType,
    ) -> Result<Vec<u8>> {
        let target = self.peer(peer)?;
        let bytes = target.analog.set_channel(node, channel, value, measure)?;
        target.sender.send_bytes(&bytes).await;
        debug!(peer = %target.config.name, node, channel, value, %measure, "Number written");
        Ok(bytes)
    }

    /// Resend every page written to one CMI
    pub async fn resend_all(&self, peer: IpAddr) -> Result<usize> {
        Ok(self.peer(peer)?.resend(&self.stats).await)
    }

    /// Resend every page written to every CMI
    pub async fn resend_all_peers(&self) -> usize {
        let mut sent = 0;
        for peer in self.peers.values() {
            sent += peer.resend(&self.stats).await;
        }
        sent
    }

    /// Publish the availability of every configured CMI
    pub async fn publish_availability(&self) -> usize {
        publish_statuses(&self.liveness, self.publisher.as_ref(), &self.stats).await
    }

    /// Availability of every configured CMI
    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.liveness.statuses(Utc::now())
    }

    /// Last value of an analog channel reported by a remote node
    pub fn inbound_analog(&self, node: u8, channel: u16) -> AnalogValue {
        self.inbound
            .lookup(node)
            .map(|registries| registries.analog.channel_data(node, channel))
            .unwrap_or_else(AnalogValue::unknown)
    }

    /// Last state of a digital channel reported by a remote node
    pub fn inbound_digital(&self, node: u8, channel: u16) -> DigitalValue {
        self.inbound
            .lookup(node)
            .map(|registries| registries.digital.channel_data(node, channel))
            .unwrap_or_else(DigitalValue::unknown)
    }

    /// Last analog value written to a CMI
    pub fn outbound_analog(&self, peer: IpAddr, node: u8, channel: u16) -> Result<AnalogValue> {
        Ok(self.peer(peer)?.analog.channel_data(node, channel))
    }

    /// Last digital state written to a CMI
    pub fn outbound_digital(&self, peer: IpAddr, node: u8, channel: u16) -> Result<DigitalValue> {
        Ok(self.peer(peer)?.digital.channel_data(node, channel))
    }

    /// Snapshot of the bridge counters
    pub fn stats(&self) -> BridgeStats {
        let counters = &self.stats;
        BridgeStats {
            datagrams_received: read(&counters.datagrams_received),
            decode_errors: read(&counters.decode_errors),
            analog_updates: read(&counters.analog_updates),
            digital_updates: read(&counters.digital_updates),
            events_published: read(&counters.events_published),
            events_dropped: read(&counters.events_dropped),
            publish_errors: read(&counters.publish_errors),
            datagrams_sent: self.peers.values().map(|p| p.sender.datagrams_sent()).sum(),
            send_failures: self.peers.values().map(|p| p.sender.send_failures()).sum(),
            resends: read(&counters.resends),
        }
    }

    fn peer(&self, address: IpAddr) -> Result<&OutboundPeer> {
        self.peers
            .get(&address)
            .map(|peer| peer.as_ref())
            .ok_or(CoeError::UnknownPeer(address))
    }
}

impl std::fmt::Debug for CoeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoeBridge")
            .field("listen_addr", &self.config.listen_addr)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_pump(
    mut event_rx: mpsc::Receiver<ChannelEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    publisher: Arc<dyn StatePublisher>,
    stats: Arc<StatsCounters>,
) -> mpsc::Receiver<ChannelEvent> {
    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => break,

            event = event_rx.recv() => match event {
                Some(event) => publish_event(publisher.as_ref(), event, &stats).await,
                None => break,
            }
        }
    }

    // Flush what the receiver queued before it stopped
    while let Ok(event) = event_rx.try_recv() {
        publish_event(publisher.as_ref(), event, &stats).await;
    }
    event_rx
}

async fn publish_event(publisher: &dyn StatePublisher, event: ChannelEvent, stats: &StatsCounters) {
    let result = match event {
        ChannelEvent::Sensor { source, value } => {
            publisher.publish_sensor_update(source, value).await
        }
        ChannelEvent::Binary { source, value } => {
            publisher.publish_binary_update(source, value).await
        }
    };
    match result {
        Ok(()) => bump(&stats.events_published),
        Err(e) => report_publish_error(&e, stats, "channel update"),
    }
}

fn report_publish_error(e: &CoeError, stats: &StatsCounters, what: &str) {
    bump(&stats.publish_errors);
    if e.is_retriable() {
        warn!(code = e.error_code(), "Failed to publish {}: {}", what, e);
    } else {
        error!(code = e.error_code(), "Publisher rejected {}: {}", what, e);
    }
}

async fn publish_statuses(
    liveness: &LivenessTracker,
    publisher: &dyn StatePublisher,
    stats: &StatsCounters,
) -> usize {
    let mut published = 0;
    for status in liveness.statuses(Utc::now()) {
        match publisher
            .publish_device_availability(status.address, status.online)
            .await
        {
            Ok(()) => published += 1,
            Err(e) => report_publish_error(&e, stats, "peer availability"),
        }
    }
    trace!(published, "Availability published");
    published
}
