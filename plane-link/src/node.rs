//! Session runtime for one device.
//!
//! A [`Node`] ties a [`Broker`] to the plane engine and the object table.
//! It runs one event-loop task that interprets broker events:
//!
//! - **Master**: a `Hello` gets the joining device a viewport and the full
//!   replica (plane, every viewport, every object as ADD); the new viewport
//!   is broadcast to everyone else. An `ObjectUpdate` from peer P is applied
//!   and, if it changed anything, relayed to every peer except P. A peer
//!   that leaves has its viewport released everywhere.
//! - **Slave**: plane, viewport and object records overwrite the local
//!   replica. Nothing is ever relayed.
//!
//! Local edits (`add_object`, `drag`, ...) are applied immediately, then
//! broadcast (Master) or sent up the uplink (Slave). Drag MOVEs go through a
//! latest-wins [`DragCoalescer`] flushed on a fixed interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use plane_core::{
    place_viewport, Authority, DragCoalescer, ObjectStore, PlaneEngine, PlaneError, Rect, Role,
    ScreenRect, SyncObject, Viewport, ViewportPatch, VirtualPlane,
};
use plane_types::{
    Bye, DeviceId, Hello, ObjectUpdate, Orientation, PeerId, PlaneInit, Record, ScreenInfo,
    ServiceId, ViewportAssign, ViewportRelease, PROTOCOL_VERSION,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerError, BrokerEvent, BrokerSettings};
use crate::transport::Transport;

/// Errors from node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Rejected plane or viewport change.
    #[error(transparent)]
    Plane(#[from] PlaneError),

    /// Broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Operation needs the Master role.
    #[error("only the master can do this")]
    NotMaster,

    /// No object with this id.
    #[error("unknown object: {0}")]
    UnknownObject(String),
}

/// Plane parameters a Master starts with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneSettings {
    /// Width in VU
    pub width_vu: f64,
    /// Height in VU
    pub height_vu: f64,
    /// dp per VU
    pub global_scale_dp_per_vu: f64,
}

/// Static configuration of a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This device
    pub device_id: DeviceId,
    /// Service id to listen and connect under
    pub service: ServiceId,
    /// This device's screen
    pub screen: ScreenInfo,
    /// Orientation of this device's own viewport when it is Master
    pub orientation: Orientation,
    /// Plane used when this device becomes Master with no replica
    pub plane: PlaneSettings,
    /// Drag flush interval; zero sends every MOVE immediately
    pub drag_flush_interval: Duration,
    /// Broker tuning
    pub broker: BrokerSettings,
    /// Capacity of the [`NodeEvent`] broadcast channel
    pub event_capacity: usize,
}

impl NodeConfig {
    /// Config with default service, tuning and a 60 fps drag flush.
    pub fn new(device_id: DeviceId, screen: ScreenInfo, plane: PlaneSettings) -> Self {
        Self {
            device_id,
            service: ServiceId::default(),
            screen,
            orientation: Orientation::Normal,
            plane,
            drag_flush_interval: Duration::from_millis(16),
            broker: BrokerSettings::default(),
            event_capacity: 256,
        }
    }
}

/// What the application sees happen.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Role committed or dropped.
    RoleChanged {
        /// New role, `None` when offline.
        role: Option<Role>,
    },
    /// A device completed its handshake with this Master.
    PeerJoined {
        /// Connection id
        peer: PeerId,
        /// Device behind it
        device_id: DeviceId,
    },
    /// A peer of this Master went away.
    PeerLeft {
        /// Connection id
        peer: PeerId,
        /// Device whose viewport was released, if any
        device_id: Option<DeviceId>,
        /// Why
        reason: String,
    },
    /// The object table changed.
    ObjectChanged(ObjectUpdate),
    /// The plane or viewport table changed.
    ViewportsChanged,
    /// The Slave uplink went away.
    UplinkLost {
        /// Why
        reason: String,
    },
    /// The Master listener died.
    ListenerFailed {
        /// Why
        error: String,
    },
    /// A record was dropped or a remote change was rejected.
    Error {
        /// What went wrong
        error: String,
    },
}

/// Point-in-time copy of everything a renderer needs.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    /// This device
    pub device_id: DeviceId,
    /// Current role
    pub role: Option<Role>,
    /// Plane, if known
    pub plane: Option<VirtualPlane>,
    /// Every viewport, ordered by device
    pub viewports: Vec<Viewport>,
    /// Every object, ordered by id
    pub objects: Vec<SyncObject>,
    /// Accepted peers (Master only)
    pub peers: usize,
}

struct NodeState {
    role: Option<Role>,
    engine: PlaneEngine,
    store: ObjectStore,
    coalescer: DragCoalescer,
    /// Handshaken peers (Master only)
    devices: HashMap<PeerId, DeviceId>,
}

struct Inner {
    config: NodeConfig,
    broker: Broker,
    state: Mutex<NodeState>,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a running session. Clones share the session.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device_id", &self.inner.config.device_id)
            .field("role", &self.role())
            .field("broker", &self.inner.broker)
            .finish()
    }
}

impl Node {
    /// Create a node and spawn its background tasks. Needs a Tokio runtime.
    ///
    /// The node starts offline: call [`Node::become_master`] or
    /// [`Node::join`] (or hand it to an [`crate::Orchestrator`]).
    pub fn start(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let (broker, broker_events) = Broker::new(transport, config.broker);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let flush_interval = config.drag_flush_interval;

        let inner = Arc::new(Inner {
            config,
            broker,
            state: Mutex::new(NodeState {
                role: None,
                engine: PlaneEngine::new(),
                store: ObjectStore::new(Authority::Cache),
                coalescer: DragCoalescer::new(),
                devices: HashMap::new(),
            }),
            events,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(event_loop(
            Arc::downgrade(&inner),
            broker_events,
            inner.cancel.clone(),
        ));
        if !flush_interval.is_zero() {
            tokio::spawn(flush_loop(
                Arc::downgrade(&inner),
                flush_interval,
                inner.cancel.clone(),
            ));
        }

        Self { inner }
    }

    /// This device's id.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.config.device_id
    }

    /// Configuration the node was started with.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Current role.
    pub fn role(&self) -> Option<Role> {
        self.state().role
    }

    /// Number of accepted peers (Master only).
    pub fn peer_count(&self) -> usize {
        self.inner.broker.peer_count()
    }

    /// Listener address while Master.
    pub fn local_address(&self) -> Option<String> {
        self.inner.broker.local_address()
    }

    /// Subscribe to [`NodeEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Become Master: set up the plane, claim a viewport, start listening.
    ///
    /// A replica inherited from a previous session keeps its plane and
    /// objects so the global scale does not change under existing content.
    /// Returns the listen address.
    pub async fn become_master(&self) -> Result<String, NodeError> {
        let engine = {
            let state = self.state();
            let settings = self.inner.config.plane;
            let plane = state.engine.plane().unwrap_or(VirtualPlane {
                width_vu: settings.width_vu,
                height_vu: settings.height_vu,
                global_scale_dp_per_vu: settings.global_scale_dp_per_vu,
            });
            let mut engine = PlaneEngine::new();
            engine.init_plane(plane.width_vu, plane.height_vu, plane.global_scale_dp_per_vu)?;
            let own = place_viewport(
                &engine,
                &self.inner.config.device_id,
                self.inner.config.screen,
                self.inner.config.orientation,
            )?;
            engine.define_viewport(own)?;
            engine
        };

        self.inner.broker.close_uplink();
        let address = self
            .inner
            .broker
            .start_master(&self.inner.config.service)
            .await?;

        {
            let mut state = self.state();
            state.role = Some(Role::Master);
            state.engine = engine;
            state.store.set_authority(Authority::Authoritative);
            state.devices.clear();
        }
        tracing::info!(device = %self.inner.config.device_id, address = %address, "became master");
        self.emit(NodeEvent::RoleChanged {
            role: Some(Role::Master),
        });
        self.emit(NodeEvent::ViewportsChanged);
        Ok(address)
    }

    /// Become Slave of the Master at `address` and send the handshake.
    ///
    /// The local replica is discarded; the Master's state replaces it.
    pub async fn join(&self, address: &str) -> Result<PeerId, NodeError> {
        self.inner.broker.stop_master();
        let peer = self
            .inner
            .broker
            .connect(address, &self.inner.config.service)
            .await?;

        {
            let mut state = self.state();
            state.role = Some(Role::Slave);
            state.engine.clear();
            state.store.clear();
            state.store.set_authority(Authority::Cache);
            state.devices.clear();
            state.coalescer.drain();
        }

        let hello = Record::Hello(Hello {
            version: PROTOCOL_VERSION,
            service: self.inner.config.service.clone(),
            device_id: self.inner.config.device_id.clone(),
            screen: self.inner.config.screen,
        });
        if let Err(e) = self.inner.broker.send(&hello).await {
            self.state().role = None;
            return Err(e.into());
        }

        tracing::info!(device = %self.inner.config.device_id, master = %peer, "joined");
        self.emit(NodeEvent::RoleChanged {
            role: Some(Role::Slave),
        });
        self.emit(NodeEvent::ViewportsChanged);
        Ok(peer)
    }

    /// Stop being Master: close the listener and every peer. The replica is
    /// kept.
    pub fn stop_listening(&self) {
        self.inner.broker.stop_master();
        let was_master = {
            let mut state = self.state();
            state.devices.clear();
            if state.role == Some(Role::Master) {
                state.role = None;
                true
            } else {
                false
            }
        };
        if was_master {
            self.emit(NodeEvent::RoleChanged { role: None });
        }
    }

    /// Close every connection and clear all state. The node stays usable.
    pub fn reset(&self) {
        self.inner.broker.stop();
        let had_role = {
            let mut state = self.state();
            state.engine.clear();
            state.store.clear();
            state.coalescer.drain();
            state.devices.clear();
            state.role.take().is_some()
        };
        if had_role {
            self.emit(NodeEvent::RoleChanged { role: None });
        }
    }

    /// Say goodbye and shut the node down for good. Idempotent.
    pub async fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.flush_drags().await;
        let bye = Record::Bye(Bye {
            reason: Some("shutting down".to_string()),
        });
        match self.role() {
            Some(Role::Master) => {
                let _ = self.inner.broker.broadcast(&bye, None).await;
            }
            Some(Role::Slave) => {
                let _ = self.inner.broker.send(&bye).await;
            }
            None => {}
        }
        self.inner.cancel.cancel();
        self.reset();
        tracing::info!(device = %self.inner.config.device_id, "node stopped");
    }

    /// Add (or overwrite) an object.
    pub async fn add_object(&self, id: &str, rect: Rect) -> Result<(), NodeError> {
        let update = ObjectUpdate::add(id, rect.x, rect.y, rect.width, rect.height);
        self.local_update(update).await.map(|_| ())
    }

    /// Move an object to an absolute plane position, keeping its size.
    pub async fn move_object(&self, id: &str, x: f64, y: f64) -> Result<SyncObject, NodeError> {
        let update = {
            let state = self.state();
            let object = state
                .store
                .get(id)
                .ok_or_else(|| NodeError::UnknownObject(id.to_string()))?;
            ObjectUpdate::moved(id, x, y, object.width, object.height)
        };
        self.apply_move(update).await
    }

    /// Drag an object by a delta in this device's local dp.
    ///
    /// The delta is mapped through this device's viewport orientation and
    /// the global scale, so a drag looks the same on every screen.
    pub async fn drag(&self, id: &str, dx_dp: f64, dy_dp: f64) -> Result<SyncObject, NodeError> {
        let update = {
            let state = self.state();
            let object = state
                .store
                .get(id)
                .ok_or_else(|| NodeError::UnknownObject(id.to_string()))?;
            let (dx, dy) = state.engine.local_delta_to_virtual(
                &self.inner.config.device_id,
                dx_dp,
                dy_dp,
            )?;
            ObjectUpdate::moved(id, object.x + dx, object.y + dy, object.width, object.height)
        };
        self.apply_move(update).await
    }

    /// Remove an object. Removing an unknown id is a no-op.
    pub async fn remove_object(&self, id: &str) -> Result<(), NodeError> {
        self.local_update(ObjectUpdate::remove(id)).await.map(|_| ())
    }

    /// Rotate, resize or move a device's viewport (Master only). The new
    /// geometry is broadcast to every peer.
    pub async fn update_viewport(
        &self,
        device_id: &DeviceId,
        patch: &ViewportPatch,
    ) -> Result<Viewport, NodeError> {
        let updated = {
            let mut state = self.state();
            if state.role != Some(Role::Master) {
                return Err(NodeError::NotMaster);
            }
            state.engine.update_viewport(device_id, patch)?
        };
        self.inner
            .broker
            .broadcast(&Record::ViewportAssign(updated.to_assign()), None)
            .await?;
        self.emit(NodeEvent::ViewportsChanged);
        Ok(updated)
    }

    /// Current plane, viewports and objects.
    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state();
        let plane = state.engine.snapshot();
        NodeSnapshot {
            device_id: self.inner.config.device_id.clone(),
            role: state.role,
            plane: plane.plane,
            viewports: plane.viewports.values().cloned().collect(),
            objects: state.store.snapshot(),
            peers: self.inner.broker.peer_count(),
        }
    }

    /// Objects visible on this device with their clipped pixel rectangles.
    pub fn visible_objects(&self) -> Result<Vec<(SyncObject, ScreenRect)>, NodeError> {
        let state = self.state();
        let own = &self.inner.config.device_id;
        let mut visible = Vec::new();
        for object in state.store.snapshot() {
            let rect = Rect::new(object.x, object.y, object.width, object.height);
            if let Some(screen) = state.engine.project_rect(own, rect)? {
                visible.push((object, screen));
            }
        }
        Ok(visible)
    }

    /// Send every pending drag MOVE now.
    pub async fn flush_drags(&self) {
        let (role, pending) = {
            let mut state = self.state();
            (state.role, state.coalescer.drain())
        };
        for update in pending {
            if let Err(e) = self.dispatch(role, update).await {
                tracing::debug!(error = %e, "drag flush failed");
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn apply_move(&self, update: ObjectUpdate) -> Result<SyncObject, NodeError> {
        let id = update.id.clone();
        self.local_update(update).await?;
        self.state()
            .store
            .get(&id)
            .cloned()
            .ok_or(NodeError::UnknownObject(id))
    }

    /// Apply a local edit, then send it (or park it in the coalescer).
    async fn local_update(&self, update: ObjectUpdate) -> Result<bool, NodeError> {
        let coalesce = !self.inner.config.drag_flush_interval.is_zero();
        let (role, changed, outgoing) = {
            let mut state = self.state();
            let changed = state.store.apply(&update);
            let outgoing = if !changed {
                None
            } else if coalesce {
                state.coalescer.push(update.clone())
            } else {
                Some(update.clone())
            };
            (state.role, changed, outgoing)
        };

        if changed {
            self.emit(NodeEvent::ObjectChanged(update));
        }
        if let Some(outgoing) = outgoing {
            self.dispatch(role, outgoing).await?;
        }
        Ok(changed)
    }

    async fn dispatch(&self, role: Option<Role>, update: ObjectUpdate) -> Result<(), NodeError> {
        let record = Record::ObjectUpdate(update);
        match role {
            Some(Role::Master) => {
                self.inner.broker.broadcast(&record, None).await?;
            }
            Some(Role::Slave) => self.inner.broker.send(&record).await?,
            None => {}
        }
        Ok(())
    }

    async fn handle_broker_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::PeerConnected { peer } => {
                tracing::debug!(peer = %peer, "awaiting hello");
            }
            BrokerEvent::Record { from, record } => self.handle_record(from, record).await,
            BrokerEvent::PeerDisconnected { peer, reason } => self.on_peer_left(peer, reason).await,
            BrokerEvent::UplinkClosed { peer, reason } => {
                let was_slave = {
                    let mut state = self.state();
                    if state.role == Some(Role::Slave) {
                        state.role = None;
                        true
                    } else {
                        false
                    }
                };
                tracing::warn!(master = %peer, reason = %reason, "uplink lost");
                if was_slave {
                    self.emit(NodeEvent::RoleChanged { role: None });
                }
                self.emit(NodeEvent::UplinkLost { reason });
            }
            BrokerEvent::ProtocolError { peer, error } => {
                self.emit(NodeEvent::Error {
                    error: format!("{peer}: {error}"),
                });
            }
            BrokerEvent::ListenerFailed { error } => {
                self.emit(NodeEvent::ListenerFailed { error });
            }
        }
    }

    async fn handle_record(&self, from: PeerId, record: Record) {
        let role = self.role();
        match (role, record) {
            (Some(Role::Master), Record::Hello(hello)) => self.on_hello(from, hello).await,
            (Some(Role::Master), Record::ObjectUpdate(update)) => {
                self.relay_update(from, update).await
            }
            (Some(Role::Master), Record::Bye(bye)) => {
                let reason = bye.reason.unwrap_or_else(|| "bye".to_string());
                self.inner.broker.disconnect(&from, &reason).await;
            }
            (Some(Role::Slave), Record::PlaneInit(init)) => self.on_plane_init(init),
            (Some(Role::Slave), Record::ViewportAssign(assign)) => self.on_viewport_assign(assign),
            (Some(Role::Slave), Record::ViewportRelease(release)) => {
                let removed = self.state().engine.remove_viewport(&release.device_id);
                if removed.is_some() {
                    self.emit(NodeEvent::ViewportsChanged);
                }
            }
            (Some(Role::Slave), Record::ObjectUpdate(update)) => {
                let changed = self.state().store.apply(&update);
                if changed {
                    self.emit(NodeEvent::ObjectChanged(update));
                }
            }
            (Some(Role::Slave), Record::Bye(bye)) => {
                tracing::info!(master = %from, reason = ?bye.reason, "master said bye");
            }
            (role, record) => {
                tracing::warn!(peer = %from, role = ?role, kind = record.kind(), "unexpected record");
                self.emit(NodeEvent::Error {
                    error: format!("unexpected {} from {from}", record.kind()),
                });
            }
        }
    }

    /// Master: apply a peer's update and relay it to everyone else.
    async fn relay_update(&self, from: PeerId, update: ObjectUpdate) {
        let changed = self.state().store.apply(&update);
        if !changed {
            return;
        }
        let record = Record::ObjectUpdate(update.clone());
        if let Err(e) = self.inner.broker.broadcast(&record, Some(&from)).await {
            tracing::warn!(error = %e, "relay failed");
        }
        self.emit(NodeEvent::ObjectChanged(update));
    }

    /// Master: handshake a joining device.
    async fn on_hello(&self, from: PeerId, hello: Hello) {
        if hello.version != PROTOCOL_VERSION || hello.service != self.inner.config.service {
            let reason = format!(
                "incompatible hello: version {} service {}",
                hello.version, hello.service
            );
            self.reject(&from, reason).await;
            return;
        }

        let placed = {
            let mut state = self.state();
            let placed = place_viewport(
                &state.engine,
                &hello.device_id,
                hello.screen,
                Orientation::Normal,
            )
            .and_then(|viewport| {
                state.engine.define_viewport(viewport.clone())?;
                Ok(viewport)
            });
            placed.map(|viewport| {
                state.devices.insert(from.clone(), hello.device_id.clone());
                let mut replies = Vec::new();
                if let Some(plane) = state.engine.plane() {
                    replies.push(Record::PlaneInit(plane.to_init()));
                }
                replies.extend(
                    state
                        .engine
                        .viewports()
                        .map(|v| Record::ViewportAssign(v.to_assign())),
                );
                replies.extend(
                    state
                        .store
                        .as_add_records()
                        .into_iter()
                        .map(Record::ObjectUpdate),
                );
                (viewport, replies)
            })
        };

        let (viewport, replies) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                self.reject(&from, format!("cannot place {}: {e}", hello.device_id))
                    .await;
                return;
            }
        };

        for reply in &replies {
            if let Err(e) = self.inner.broker.send_to(&from, reply).await {
                tracing::warn!(peer = %from, error = %e, "handshake send failed");
                return;
            }
        }
        let assign = Record::ViewportAssign(viewport.to_assign());
        if let Err(e) = self.inner.broker.broadcast(&assign, Some(&from)).await {
            tracing::warn!(error = %e, "viewport broadcast failed");
        }

        tracing::info!(
            peer = %from,
            device = %hello.device_id,
            offset_x = viewport.offset_x,
            width = viewport.width,
            "device joined"
        );
        self.emit(NodeEvent::PeerJoined {
            peer: from,
            device_id: hello.device_id,
        });
        self.emit(NodeEvent::ViewportsChanged);
    }

    async fn reject(&self, peer: &PeerId, reason: String) {
        tracing::warn!(peer = %peer, reason = %reason, "rejecting peer");
        let bye = Record::Bye(Bye {
            reason: Some(reason.clone()),
        });
        let _ = self.inner.broker.send_to(peer, &bye).await;
        self.inner.broker.disconnect(peer, &reason).await;
        self.emit(NodeEvent::Error { error: reason });
    }

    /// Master: a peer left; release its viewport everywhere.
    async fn on_peer_left(&self, peer: PeerId, reason: String) {
        let released = {
            let mut state = self.state();
            match state.devices.remove(&peer) {
                // a rejoined device may still be connected under another peer id
                Some(device) if !state.devices.values().any(|d| d == &device) => state
                    .engine
                    .remove_viewport(&device)
                    .map(|_| device),
                _ => None,
            }
        };

        tracing::info!(peer = %peer, reason = %reason, device = ?released, "peer left");
        if let Some(device_id) = &released {
            let release = Record::ViewportRelease(ViewportRelease {
                device_id: device_id.clone(),
            });
            if let Err(e) = self.inner.broker.broadcast(&release, None).await {
                tracing::warn!(error = %e, "release broadcast failed");
            }
        }
        self.emit(NodeEvent::PeerLeft {
            peer,
            device_id: released.clone(),
            reason,
        });
        if released.is_some() {
            self.emit(NodeEvent::ViewportsChanged);
        }
    }

    /// Slave: the Master's plane replaces ours.
    fn on_plane_init(&self, init: PlaneInit) {
        let mut engine = PlaneEngine::new();
        match engine.init_plane(init.width_vu, init.height_vu, init.global_scale_dp_per_vu) {
            Ok(_) => {
                self.state().engine = engine;
                self.emit(NodeEvent::ViewportsChanged);
            }
            Err(e) => self.emit(NodeEvent::Error {
                error: format!("rejected plane: {e}"),
            }),
        }
    }

    /// Slave: store a viewport assignment.
    ///
    /// Only the own device's screen is known locally; other devices'
    /// viewports keep whatever screen they had, or get one derived from
    /// their plane size at density 1.
    fn on_viewport_assign(&self, assign: ViewportAssign) {
        let result = {
            let mut state = self.state();
            let screen = if assign.device_id == self.inner.config.device_id {
                self.inner.config.screen
            } else if let Ok(existing) = state.engine.viewport(&assign.device_id) {
                existing.screen()
            } else {
                let scale = state
                    .engine
                    .global_scale()
                    .unwrap_or(1.0);
                let (w, h) = if assign.orientation.swaps_axes() {
                    (assign.height, assign.width)
                } else {
                    (assign.width, assign.height)
                };
                ScreenInfo {
                    width_dp: w * scale,
                    height_dp: h * scale,
                    density: 1.0,
                }
            };
            state
                .engine
                .define_viewport(Viewport::from_assign(&assign, screen))
        };
        match result {
            Ok(()) => self.emit(NodeEvent::ViewportsChanged),
            Err(e) => {
                tracing::warn!(device = %assign.device_id, error = %e, "rejected viewport");
                self.emit(NodeEvent::Error {
                    error: format!("rejected viewport for {}: {e}", assign.device_id),
                });
            }
        }
    }
}

async fn event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<BrokerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        Node { inner }.handle_broker_event(event).await;
    }
}

async fn flush_loop(inner: Weak<Inner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        Node { inner }.flush_drags().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};

    fn config(id: &str) -> NodeConfig {
        let mut config = NodeConfig::new(
            DeviceId::new(id),
            ScreenInfo {
                width_dp: 400.0,
                height_dp: 480.0,
                density: 2.0,
            },
            PlaneSettings {
                width_vu: 2000.0,
                height_vu: 1200.0,
                global_scale_dp_per_vu: 0.4,
            },
        );
        config.drag_flush_interval = Duration::ZERO;
        config
    }

    fn node(network: &MemoryNetwork, id: &str) -> Node {
        let transport = MemoryTransport::new(network, format!("mem://{id}"));
        Node::start(config(id), Arc::new(transport))
    }

    #[tokio::test]
    async fn offline_edits_apply_locally() {
        let network = MemoryNetwork::new();
        let node = node(&network, "solo");
        node.add_object("card", Rect::new(1.0, 2.0, 3.0, 4.0))
            .await
            .unwrap();
        assert_eq!(node.snapshot().objects.len(), 1);
        assert_eq!(node.role(), None);
    }

    #[tokio::test]
    async fn master_claims_leftmost_viewport() {
        let network = MemoryNetwork::new();
        let node = node(&network, "m");
        let address = node.become_master().await.unwrap();
        assert_eq!(address, "mem://m");

        let snapshot = node.snapshot();
        assert_eq!(snapshot.role, Some(Role::Master));
        assert_eq!(snapshot.viewports.len(), 1);
        assert_eq!(snapshot.viewports[0].offset_x, 0.0);
    }

    #[tokio::test]
    async fn drag_needs_a_viewport() {
        let network = MemoryNetwork::new();
        let node = node(&network, "solo");
        node.add_object("card", Rect::new(0.0, 0.0, 10.0, 10.0))
            .await
            .unwrap();
        assert!(matches!(
            node.drag("card", 4.0, 0.0).await,
            Err(NodeError::Plane(_))
        ));
    }

    #[tokio::test]
    async fn drag_converts_dp_to_vu() {
        let network = MemoryNetwork::new();
        let node = node(&network, "m");
        node.become_master().await.unwrap();
        node.add_object("card", Rect::new(100.0, 100.0, 10.0, 10.0))
            .await
            .unwrap();

        // 4 dp at 0.4 dp/VU is 10 VU
        let moved = node.drag("card", 4.0, -2.0).await.unwrap();
        assert!((moved.x - 110.0).abs() < 1e-9);
        assert!((moved.y - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_object_errors() {
        let network = MemoryNetwork::new();
        let node = node(&network, "m");
        assert!(matches!(
            node.move_object("ghost", 1.0, 1.0).await,
            Err(NodeError::UnknownObject(_))
        ));
    }

    #[tokio::test]
    async fn update_viewport_requires_master() {
        let network = MemoryNetwork::new();
        let node = node(&network, "s");
        assert!(matches!(
            node.update_viewport(&DeviceId::new("s"), &ViewportPatch::default())
                .await,
            Err(NodeError::NotMaster)
        ));
    }

    #[tokio::test]
    async fn invalid_viewport_update_keeps_prior() {
        let network = MemoryNetwork::new();
        let node = node(&network, "m");
        node.become_master().await.unwrap();

        let err = node
            .update_viewport(&DeviceId::new("m"), &ViewportPatch::offset(1500.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Plane(PlaneError::OutOfBounds { .. })));
        assert_eq!(node.snapshot().viewports[0].offset_x, 0.0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let network = MemoryNetwork::new();
        let node = node(&network, "m");
        node.become_master().await.unwrap();
        node.stop().await;
        node.stop().await;
        assert_eq!(node.role(), None);
        assert_eq!(node.peer_count(), 0);
        assert!(node.local_address().is_none());
    }

    #[tokio::test]
    async fn visible_objects_are_clipped() {
        let network = MemoryNetwork::new();
        let node = node(&network, "m");
        node.become_master().await.unwrap();
        node.add_object("inside", Rect::new(10.0, 10.0, 10.0, 10.0))
            .await
            .unwrap();
        node.add_object("outside", Rect::new(1500.0, 10.0, 10.0, 10.0))
            .await
            .unwrap();

        let visible = node.visible_objects().unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0.id, "inside");
    }
}
