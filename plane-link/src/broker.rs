//! Connection broker.
//!
//! The broker owns every stream of a device. As Master it accepts peers
//! into a concurrent peer set and fans records out to them; as Slave it
//! holds a single uplink. It does not interpret records: decoded records,
//! connects and disconnects are delivered as [`BrokerEvent`]s on the channel
//! returned by [`Broker::new`], and the session layer decides what to do.
//!
//! # Star-topology rule
//!
//! [`Broker::broadcast`] takes an optional peer to exclude. The Master
//! relays a record received from peer P with `exclude = Some(P)`, so the
//! originator never gets its own update echoed back.
//!
//! # Failure isolation
//!
//! Each peer has its own bounded outbound queue drained by its own writer
//! task. A peer whose queue is full or closed is dropped from the set and a
//! `PeerDisconnected` event is emitted; the rest of the broadcast proceeds.
//! Drops are reported without waiting on the event channel, so the session
//! loop that drains that channel can broadcast freely.
//!
//! The Slave uplink is never dropped for being full: [`Broker::send`] waits
//! for room up to [`BrokerSettings::uplink_send_timeout`] and then fails
//! with [`BrokerError::Congested`], leaving the uplink open. Only a closed
//! writer tears the uplink down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use plane_types::frame::encode_frame;
use plane_types::{Encoding, PeerId, Record, ServiceId, WireError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{self, PeerHandle};
use crate::transport::{Transport, TransportError};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Record could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// `start_master` while a listener is already open.
    #[error("already listening")]
    AlreadyListening,

    /// `send` without an uplink.
    #[error("not connected")]
    NotConnected,

    /// No such peer in the set.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The uplink queue stayed full; nothing was sent and the uplink is
    /// still open.
    #[error("uplink to {0} is congested")]
    Congested(PeerId),

    /// The peer's queue was full or closed; it has been dropped.
    #[error("peer {peer} dropped: {reason}")]
    PeerDropped {
        /// Dropped peer.
        peer: PeerId,
        /// Why.
        reason: String,
    },
}

/// Events delivered by the broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A peer was accepted into the Master's peer set.
    PeerConnected {
        /// Peer id (remote address).
        peer: PeerId,
    },
    /// A peer left the Master's peer set.
    PeerDisconnected {
        /// Peer id.
        peer: PeerId,
        /// Why.
        reason: String,
    },
    /// The Slave uplink closed or failed. No reconnect is attempted.
    UplinkClosed {
        /// Master's peer id.
        peer: PeerId,
        /// Why.
        reason: String,
    },
    /// A record arrived.
    Record {
        /// Sender.
        from: PeerId,
        /// Decoded record.
        record: Record,
    },
    /// A frame was dropped because it could not be decoded.
    ProtocolError {
        /// Sender.
        peer: PeerId,
        /// What was wrong.
        error: String,
    },
    /// The listener stopped accepting.
    ListenerFailed {
        /// Why.
        error: String,
    },
}

/// Broker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Frames queued per peer before the peer is considered too slow.
    pub outbound_capacity: usize,
    /// Body encoding for outgoing records.
    pub encoding: Encoding,
    /// How long [`Broker::send`] waits for room in the uplink queue.
    pub uplink_send_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            outbound_capacity: 256,
            encoding: Encoding::Compact,
            uplink_send_timeout: Duration::from_secs(2),
        }
    }
}

/// Which set a connection lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerSlot {
    /// Accepted by the Master
    Peer,
    /// The Slave's uplink
    Uplink,
}

/// State shared with the accept loop and the connection tasks.
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    settings: BrokerSettings,
    events: mpsc::Sender<BrokerEvent>,
    peers: DashMap<PeerId, PeerHandle>,
    uplink: DashMap<PeerId, PeerHandle>,
    next_serial: AtomicU64,
    control: Mutex<Control>,
}

struct Control {
    /// Parent of every task; replaced after `stop()` so the broker can be
    /// reused.
    root: CancellationToken,
    listener: Option<ListenerState>,
}

struct ListenerState {
    cancel: CancellationToken,
    address: String,
}

impl Shared {
    pub(crate) fn outbound_capacity(&self) -> usize {
        self.settings.outbound_capacity.max(1)
    }

    pub(crate) async fn emit(
        &self,
        event: BrokerEvent,
    ) -> Result<(), mpsc::error::SendError<BrokerEvent>> {
        self.events.send(event).await
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, slot: PeerSlot) -> &DashMap<PeerId, PeerHandle> {
        match slot {
            PeerSlot::Peer => &self.peers,
            PeerSlot::Uplink => &self.uplink,
        }
    }

    /// Called once by each connection's reader task on exit.
    ///
    /// Only the connection currently registered under `peer` is removed;
    /// a stale connection that was replaced (same peer id, older serial) or
    /// already removed by `stop()` exits silently.
    pub(crate) async fn connection_closed(
        &self,
        slot: PeerSlot,
        peer: &PeerId,
        serial: u64,
        reason: String,
    ) {
        if self
            .set(slot)
            .remove_if(peer, |_, handle| handle.serial == serial)
            .is_none()
        {
            return;
        }
        let event = match slot {
            PeerSlot::Peer => BrokerEvent::PeerDisconnected {
                peer: peer.clone(),
                reason,
            },
            PeerSlot::Uplink => BrokerEvent::UplinkClosed {
                peer: peer.clone(),
                reason,
            },
        };
        let _ = self.emit(event).await;
    }

    /// Report an event without waiting for room in the channel.
    ///
    /// The session loop that drains the channel calls into the broker, so
    /// anything it can reach must not block on the channel.
    fn report(&self, event: BrokerEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
        }
    }

    /// Drop a peer whose queue failed and report it.
    fn drop_peer(&self, slot: PeerSlot, peer: &PeerId, serial: u64, reason: &str) {
        if let Some((_, handle)) = self
            .set(slot)
            .remove_if(peer, |_, handle| handle.serial == serial)
        {
            handle.cancel.cancel();
            tracing::warn!(peer = %peer, reason, "dropping peer");
            let event = match slot {
                PeerSlot::Peer => BrokerEvent::PeerDisconnected {
                    peer: peer.clone(),
                    reason: reason.to_string(),
                },
                PeerSlot::Uplink => BrokerEvent::UplinkClosed {
                    peer: peer.clone(),
                    reason: reason.to_string(),
                },
            };
            self.report(event);
        }
    }

    fn register(self: &Arc<Self>, slot: PeerSlot, peer: PeerId, stream: crate::transport::BoxStream) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let cancel = self.control().root.child_token();
        let handle = connection::spawn(
            Arc::clone(self),
            slot,
            peer.clone(),
            serial,
            stream,
            cancel,
        );
        if let Some(previous) = self.set(slot).insert(peer.clone(), handle) {
            tracing::debug!(peer = %peer, "replacing previous connection");
            previous.cancel.cancel();
        }
    }

    async fn enqueue(&self, slot: PeerSlot, peer: &PeerId, frame: Arc<Vec<u8>>) -> Result<(), BrokerError> {
        let handle = match self.set(slot).get(peer) {
            Some(handle) => handle.clone(),
            None => {
                return Err(match slot {
                    PeerSlot::Peer => BrokerError::UnknownPeer(peer.clone()),
                    PeerSlot::Uplink => BrokerError::NotConnected,
                })
            }
        };
        let reason = match slot {
            PeerSlot::Peer => match handle.outbound.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => "outbound queue full",
                Err(mpsc::error::TrySendError::Closed(_)) => "connection closed",
            },
            PeerSlot::Uplink => {
                let timeout = self.settings.uplink_send_timeout;
                match tokio::time::timeout(timeout, handle.outbound.send(frame)).await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(_)) => "connection closed",
                    Err(_) => {
                        tracing::debug!(peer = %peer, "uplink congested");
                        return Err(BrokerError::Congested(peer.clone()));
                    }
                }
            }
        };
        self.drop_peer(slot, peer, handle.serial, reason);
        Err(BrokerError::PeerDropped {
            peer: peer.clone(),
            reason: reason.to_string(),
        })
    }
}

/// Connection broker for one device.
pub struct Broker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("peers", &self.shared.peers.len())
            .field("uplink", &self.shared.uplink.len())
            .field("listening", &self.local_address())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create a broker and the channel its events arrive on.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: BrokerSettings,
    ) -> (Self, mpsc::Receiver<BrokerEvent>) {
        let (events, rx) = mpsc::channel(settings.event_capacity.max(1));
        let shared = Arc::new(Shared {
            transport,
            settings,
            events,
            peers: DashMap::new(),
            uplink: DashMap::new(),
            next_serial: AtomicU64::new(0),
            control: Mutex::new(Control {
                root: CancellationToken::new(),
                listener: None,
            }),
        });
        (Self { shared }, rx)
    }

    /// Open a listener under `service` and start accepting peers.
    ///
    /// Returns the address other devices can connect to.
    pub async fn start_master(&self, service: &ServiceId) -> Result<String, BrokerError> {
        if self.shared.control().listener.is_some() {
            return Err(BrokerError::AlreadyListening);
        }

        let listener = self.shared.transport.listen(service).await?;
        let address = listener.local_address();

        let cancel = {
            let mut control = self.shared.control();
            if control.listener.is_some() {
                return Err(BrokerError::AlreadyListening);
            }
            let cancel = control.root.child_token();
            control.listener = Some(ListenerState {
                cancel: cancel.clone(),
                address: address.clone(),
            });
            cancel
        };

        tracing::info!(address = %address, service = %service, "listening");
        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, cancel));
        Ok(address)
    }

    /// Close the listener and every accepted peer. Idempotent.
    pub fn stop_master(&self) {
        let listener = self.shared.control().listener.take();
        if let Some(listener) = listener {
            listener.cancel.cancel();
            tracing::info!(address = %listener.address, "listener closed");
        }
        close_all(&self.shared.peers);
    }

    /// Address of the open listener, if any.
    pub fn local_address(&self) -> Option<String> {
        self.shared
            .control()
            .listener
            .as_ref()
            .map(|l| l.address.clone())
    }

    /// Whether a listener is open.
    pub fn is_listening(&self) -> bool {
        self.shared.control().listener.is_some()
    }

    /// Ids of the accepted peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.peers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of accepted peers.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Send `record` to every accepted peer except `exclude`.
    ///
    /// Returns how many peers the record was queued for. A failing peer is
    /// dropped and reported; it never aborts delivery to the others.
    pub async fn broadcast(&self, record: &Record, exclude: Option<&PeerId>) -> Result<usize, BrokerError> {
        let frame = Arc::new(encode_frame(record, self.shared.settings.encoding)?);
        let targets: Vec<PeerId> = self
            .shared
            .peers
            .iter()
            .filter(|e| Some(e.key()) != exclude)
            .map(|e| e.key().clone())
            .collect();

        let mut delivered = 0;
        for peer in &targets {
            match self
                .shared
                .enqueue(PeerSlot::Peer, peer, Arc::clone(&frame))
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(peer = %peer, error = %e, "broadcast skipped peer"),
            }
        }
        tracing::trace!(kind = record.kind(), delivered, "broadcast");
        Ok(delivered)
    }

    /// Send `record` to one accepted peer.
    pub async fn send_to(&self, peer: &PeerId, record: &Record) -> Result<(), BrokerError> {
        let frame = Arc::new(encode_frame(record, self.shared.settings.encoding)?);
        self.shared.enqueue(PeerSlot::Peer, peer, frame).await
    }

    /// Close one accepted peer, emitting `PeerDisconnected`.
    pub async fn disconnect(&self, peer: &PeerId, reason: &str) {
        let serial = self.shared.peers.get(peer).map(|h| h.serial);
        if let Some(serial) = serial {
            self.shared.drop_peer(PeerSlot::Peer, peer, serial, reason);
        }
    }

    /// Open the Slave uplink, replacing any previous one.
    pub async fn connect(&self, address: &str, service: &ServiceId) -> Result<PeerId, BrokerError> {
        let stream = self.shared.transport.connect(address, service).await?;
        let peer = PeerId::new(address);
        close_all(&self.shared.uplink);
        self.shared.register(PeerSlot::Uplink, peer.clone(), stream);
        tracing::info!(peer = %peer, "uplink connected");
        Ok(peer)
    }

    /// Send `record` over the uplink, waiting while its queue is full.
    ///
    /// A queue that stays full past the configured timeout yields
    /// [`BrokerError::Congested`] and keeps the uplink. A closed connection
    /// tears the uplink down and emits `UplinkClosed`.
    pub async fn send(&self, record: &Record) -> Result<(), BrokerError> {
        let frame = Arc::new(encode_frame(record, self.shared.settings.encoding)?);
        let peer = self
            .uplink_peer()
            .ok_or(BrokerError::NotConnected)?;
        self.shared.enqueue(PeerSlot::Uplink, &peer, frame).await
    }

    /// The uplink's peer id, if connected.
    pub fn uplink_peer(&self) -> Option<PeerId> {
        self.shared.uplink.iter().next().map(|e| e.key().clone())
    }

    /// Close the uplink without emitting an event. Idempotent.
    pub fn close_uplink(&self) {
        close_all(&self.shared.uplink);
    }

    /// Close the listener, every peer and the uplink. Idempotent.
    ///
    /// The broker stays usable: a later `start_master` or `connect` starts
    /// from a clean slate.
    pub fn stop(&self) {
        let root = {
            let mut control = self.shared.control();
            control.listener = None;
            std::mem::replace(&mut control.root, CancellationToken::new())
        };
        // empty the sets first so exiting tasks report nothing
        let peers = drain(&self.shared.peers);
        let uplink = drain(&self.shared.uplink);
        root.cancel();
        if peers + uplink > 0 {
            tracing::info!(peers, uplink, "broker stopped");
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn close_all(set: &DashMap<PeerId, PeerHandle>) {
    for (_, handle) in drain_handles(set) {
        handle.cancel.cancel();
    }
}

fn drain(set: &DashMap<PeerId, PeerHandle>) -> usize {
    drain_handles(set).len()
}

fn drain_handles(set: &DashMap<PeerId, PeerHandle>) -> Vec<(PeerId, PeerHandle)> {
    let keys: Vec<PeerId> = set.iter().map(|e| e.key().clone()).collect();
    keys.into_iter().filter_map(|k| set.remove(&k)).collect()
}

async fn accept_loop(
    shared: Arc<Shared>,
    mut listener: Box<dyn crate::transport::Listener>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(accepted) => {
                let peer = PeerId::new(accepted.address);
                tracing::info!(peer = %peer, "peer connected");
                shared.register(PeerSlot::Peer, peer.clone(), accepted.stream);
                if shared.emit(BrokerEvent::PeerConnected { peer }).await.is_err() {
                    break;
                }
            }
            Err(TransportError::ConnectionClosed) => {
                tracing::warn!("listener closed underneath the broker");
                let _ = shared
                    .emit(BrokerEvent::ListenerFailed {
                        error: "listener closed".to_string(),
                    })
                    .await;
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "rejected inbound connection");
            }
        }
    }
    // Dropping the listener closes it.
    drop(listener);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use plane_types::ObjectUpdate;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<BrokerEvent>) -> BrokerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("event channel closed")
    }

    fn broker(network: &MemoryNetwork, address: &str) -> (Broker, mpsc::Receiver<BrokerEvent>) {
        broker_with(network, address, BrokerSettings::default())
    }

    fn broker_with(
        network: &MemoryNetwork,
        address: &str,
        settings: BrokerSettings,
    ) -> (Broker, mpsc::Receiver<BrokerEvent>) {
        Broker::new(Arc::new(MemoryTransport::new(network, address)), settings)
    }

    #[tokio::test]
    async fn master_accepts_and_receives() {
        let network = MemoryNetwork::new();
        let (master, mut master_rx) = broker(&network, "mem://m");
        let (slave, _slave_rx) = broker(&network, "mem://s");

        let address = master.start_master(&ServiceId::default()).await.unwrap();
        slave.connect(&address, &ServiceId::default()).await.unwrap();

        assert!(matches!(
            next_event(&mut master_rx).await,
            BrokerEvent::PeerConnected { peer } if peer.as_str() == "mem://s"
        ));

        let update = Record::from(ObjectUpdate::add("card", 1.0, 2.0, 3.0, 4.0));
        slave.send(&update).await.unwrap();
        match next_event(&mut master_rx).await {
            BrokerEvent::Record { from, record } => {
                assert_eq!(from.as_str(), "mem://s");
                assert_eq!(record, update);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_master_twice_fails() {
        let network = MemoryNetwork::new();
        let (master, _rx) = broker(&network, "mem://m");
        master.start_master(&ServiceId::default()).await.unwrap();
        assert!(matches!(
            master.start_master(&ServiceId::default()).await,
            Err(BrokerError::AlreadyListening)
        ));
    }

    #[tokio::test]
    async fn send_without_uplink() {
        let network = MemoryNetwork::new();
        let (slave, _rx) = broker(&network, "mem://s");
        let record = Record::from(ObjectUpdate::remove("x"));
        assert!(matches!(slave.send(&record).await, Err(BrokerError::NotConnected)));
    }

    #[tokio::test]
    async fn slave_close_is_reported_to_master() {
        let network = MemoryNetwork::new();
        let (master, mut master_rx) = broker(&network, "mem://m");
        let (slave, _slave_rx) = broker(&network, "mem://s");

        let address = master.start_master(&ServiceId::default()).await.unwrap();
        slave.connect(&address, &ServiceId::default()).await.unwrap();
        next_event(&mut master_rx).await;

        slave.close_uplink();
        assert!(matches!(
            next_event(&mut master_rx).await,
            BrokerEvent::PeerDisconnected { .. }
        ));
        assert_eq!(master.peer_count(), 0);
    }

    #[tokio::test]
    async fn master_stop_is_reported_to_slave() {
        let network = MemoryNetwork::new();
        let (master, mut master_rx) = broker(&network, "mem://m");
        let (slave, mut slave_rx) = broker(&network, "mem://s");

        let address = master.start_master(&ServiceId::default()).await.unwrap();
        slave.connect(&address, &ServiceId::default()).await.unwrap();
        next_event(&mut master_rx).await;

        master.stop();
        master.stop();
        assert!(!master.is_listening());
        assert!(matches!(
            next_event(&mut slave_rx).await,
            BrokerEvent::UplinkClosed { .. }
        ));
        assert!(slave.uplink_peer().is_none());
        assert!(matches!(
            slave.send(&Record::from(ObjectUpdate::remove("x"))).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_and_reading_continues() {
        use tokio::io::AsyncWriteExt;

        let network = MemoryNetwork::new();
        let (master, mut master_rx) = broker(&network, "mem://m");
        let address = master.start_master(&ServiceId::default()).await.unwrap();

        let raw = MemoryTransport::new(&network, "mem://raw");
        let mut stream = raw.connect(&address, &ServiceId::default()).await.unwrap();
        next_event(&mut master_rx).await;

        // unknown tag, then a valid record
        stream.write_all(&[0, 0, 0, 2, 0x7f, 0x00]).await.unwrap();
        let good = Record::from(ObjectUpdate::moved("card", 5.0, 5.0, 1.0, 1.0));
        stream
            .write_all(&encode_frame(&good, Encoding::Compact).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut master_rx).await,
            BrokerEvent::ProtocolError { .. }
        ));
        assert!(matches!(
            next_event(&mut master_rx).await,
            BrokerEvent::Record { record, .. } if record == good
        ));
        assert_eq!(master.peer_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_uplink() {
        let network = MemoryNetwork::new();
        let (m1, mut m1_rx) = broker(&network, "mem://m1");
        let (m2, mut m2_rx) = broker(&network, "mem://m2");
        let (slave, _rx) = broker(&network, "mem://s");

        let a1 = m1.start_master(&ServiceId::default()).await.unwrap();
        let a2 = m2.start_master(&ServiceId::default()).await.unwrap();

        slave.connect(&a1, &ServiceId::default()).await.unwrap();
        next_event(&mut m1_rx).await;
        slave.connect(&a2, &ServiceId::default()).await.unwrap();
        next_event(&mut m2_rx).await;

        assert_eq!(slave.uplink_peer().unwrap().as_str(), "mem://m2");
        assert!(matches!(
            next_event(&mut m1_rx).await,
            BrokerEvent::PeerDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn stalled_peers_are_dropped_while_events_back_up() {
        let network = MemoryNetwork::new();
        let settings = BrokerSettings {
            event_capacity: 1,
            outbound_capacity: 1,
            ..BrokerSettings::default()
        };
        let (master, mut master_rx) = broker_with(&network, "mem://m", settings);
        let address = master.start_master(&ServiceId::default()).await.unwrap();

        // neither peer ever reads
        let silent = MemoryTransport::new(&network, "mem://silent");
        let _silent = silent.connect(&address, &ServiceId::default()).await.unwrap();
        next_event(&mut master_rx).await;
        let idle = MemoryTransport::new(&network, "mem://idle");
        let _idle = idle.connect(&address, &ServiceId::default()).await.unwrap();
        // idle's PeerConnected stays unread and fills the event channel
        tokio::time::timeout(Duration::from_secs(2), async {
            while master.peer_count() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let update = Record::from(ObjectUpdate::moved("card", 1.0, 2.0, 3.0, 4.0));
        tokio::time::timeout(Duration::from_secs(5), async {
            while master.peer_count() > 0 {
                master.broadcast(&update, None).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("broadcast blocked on the event channel");

        let mut dropped = 0;
        while dropped < 2 {
            if let BrokerEvent::PeerDisconnected { reason, .. } = next_event(&mut master_rx).await {
                assert_eq!(reason, "outbound queue full");
                dropped += 1;
            }
        }
    }

    #[tokio::test]
    async fn uplink_burst_is_delivered_in_full() {
        let network = MemoryNetwork::new();
        let (master, mut master_rx) = broker(&network, "mem://m");
        let settings = BrokerSettings {
            outbound_capacity: 4,
            ..BrokerSettings::default()
        };
        let (slave, mut slave_rx) = broker_with(&network, "mem://s", settings);

        let address = master.start_master(&ServiceId::default()).await.unwrap();
        slave.connect(&address, &ServiceId::default()).await.unwrap();
        next_event(&mut master_rx).await;

        const BURST: usize = 5_000;
        let counter = tokio::spawn(async move {
            let mut received = 0;
            while received < BURST {
                if let BrokerEvent::Record { .. } = next_event(&mut master_rx).await {
                    received += 1;
                }
            }
            received
        });

        for i in 0..BURST {
            let update = Record::from(ObjectUpdate::moved("card", i as f64, 0.0, 1.0, 1.0));
            slave.send(&update).await.unwrap();
        }
        assert_eq!(counter.await.unwrap(), BURST);
        assert!(slave.uplink_peer().is_some());
        assert!(slave_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn congested_uplink_stays_open() {
        let network = MemoryNetwork::new();
        let deaf = MemoryTransport::new(&network, "mem://deaf");
        let mut listener = deaf.listen(&ServiceId::default()).await.unwrap();

        let settings = BrokerSettings {
            outbound_capacity: 1,
            uplink_send_timeout: Duration::from_millis(50),
            ..BrokerSettings::default()
        };
        let (slave, mut slave_rx) = broker_with(&network, "mem://s", settings);
        slave.connect("mem://deaf", &ServiceId::default()).await.unwrap();
        // accepted but never read
        let _held = listener.accept().await.unwrap();

        let update = Record::from(ObjectUpdate::moved("card", 1.0, 2.0, 3.0, 4.0));
        let mut result = Ok(());
        for _ in 0..100_000 {
            result = slave.send(&update).await;
            if result.is_err() {
                break;
            }
        }

        assert!(matches!(result, Err(BrokerError::Congested(peer)) if peer.as_str() == "mem://deaf"));
        assert_eq!(slave.uplink_peer().unwrap().as_str(), "mem://deaf");
        assert!(slave_rx.try_recv().is_err());
    }
}
