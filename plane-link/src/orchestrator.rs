//! Role orchestrator.
//!
//! Drives [`RoleState`] against a real [`Node`], transport and discovery
//! source. The state machine decides; this module only executes
//! [`RoleAction`]s and feeds their outcomes back as [`RoleEvent`]s:
//!
//! | Action           | Execution                                      |
//! |------------------|------------------------------------------------|
//! | `StartScan`      | spawned `Discovery::scan(scan_window)`         |
//! | `Probe`          | spawned connect-and-close, bounded by timeout  |
//! | `ConnectUplink`  | [`Node::join`]                                 |
//! | `StartListening` | [`Node::become_master`]                        |
//! | `StartRescanTimer` | jittered sleep, then `RescanTimer`           |
//! | `TearDown`       | [`Node::reset`]                                |
//!
//! Node-side failures (uplink lost, listener died) are mapped back into
//! role events. Results that arrive after the machine has moved on are
//! ignored by the machine itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plane_core::{with_jitter, RoleAction, RoleEvent, RoleNotice, RoleState};
use plane_types::ServiceId;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::Discovery;
use crate::node::{Node, NodeEvent};
use crate::transport::Transport;

/// Orchestrator timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// How long a discovery scan runs
    pub scan_window: Duration,
    /// Upper bound for one candidate probe
    pub probe_timeout: Duration,
    /// Base delay between rescans while Master with no peers
    pub rescan_interval: Duration,
    /// Random delay added to each rescan
    pub rescan_jitter: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            rescan_interval: Duration::from_secs(8),
            rescan_jitter: Duration::from_secs(2),
        }
    }
}

/// Handle to a running orchestrator.
pub struct Orchestrator {
    state: watch::Receiver<RoleState>,
    notices: broadcast::Sender<RoleNotice>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Orchestrator {
    /// Start negotiating a role for `node`.
    ///
    /// `transport` is used for probes only and must reach the same
    /// addresses the node connects to.
    pub fn start(
        node: Node,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(RoleState::Idle);
        let (notices, _) = broadcast::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let node_events = node.subscribe();

        let driver = Driver {
            service: node.config().service.clone(),
            node,
            transport,
            discovery,
            settings,
            role: RoleState::Idle,
            state_tx,
            notices: notices.clone(),
            events_tx,
            work: cancel.child_token(),
            rescan: None,
        };
        let task = tokio::spawn(driver.run(events_rx, node_events, cancel.clone()));

        Self {
            state: state_rx,
            notices,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Watch the role state.
    pub fn state(&self) -> watch::Receiver<RoleState> {
        self.state.clone()
    }

    /// Current role state.
    pub fn current(&self) -> RoleState {
        self.state.borrow().clone()
    }

    /// Subscribe to [`RoleNotice`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<RoleNotice> {
        self.notices.subscribe()
    }

    /// Tear down the role and stop the driver. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    node: Node,
    service: ServiceId,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    settings: OrchestratorSettings,
    role: RoleState,
    state_tx: watch::Sender<RoleState>,
    notices: broadcast::Sender<RoleNotice>,
    /// Feeds outcomes of spawned work back into the loop.
    events_tx: mpsc::Sender<RoleEvent>,
    /// Parent of every in-flight scan and probe.
    work: CancellationToken,
    rescan: Option<CancellationToken>,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<RoleEvent>,
        mut node_events: broadcast::Receiver<NodeEvent>,
        cancel: CancellationToken,
    ) {
        self.apply(RoleEvent::Start).await;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => self.with_peer_count(event),
                node_event = node_events.recv() => match node_event {
                    Ok(NodeEvent::UplinkLost { reason }) => RoleEvent::UplinkLost { reason },
                    Ok(NodeEvent::ListenerFailed { error }) => RoleEvent::ListenFailed { error },
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "orchestrator lagged behind node events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            self.apply(event).await;
        }
        self.apply(RoleEvent::Stop).await;
    }

    /// Spawned work reports before the driver gets to its result, so peer
    /// counts are read here, right before the machine sees them.
    fn with_peer_count(&self, event: RoleEvent) -> RoleEvent {
        match event {
            RoleEvent::ProbeSucceeded { address, .. } => RoleEvent::ProbeSucceeded {
                address,
                peer_count: self.node.peer_count(),
            },
            RoleEvent::RescanTimer { .. } => RoleEvent::RescanTimer {
                peer_count: self.node.peer_count(),
            },
            other => other,
        }
    }

    /// Feed one event through the machine, plus whatever its actions produce.
    async fn apply(&mut self, event: RoleEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let previous = std::mem::take(&mut self.role);
            let from = previous.name();
            let (next, actions) = previous.on_event(event);
            if next.name() != from {
                tracing::debug!(from, to = next.name(), "role state");
            }
            self.role = next;
            self.state_tx.send_replace(self.role.clone());

            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, action: RoleAction) -> Option<RoleEvent> {
        match action {
            RoleAction::StartScan | RoleAction::Rescan => {
                self.spawn_scan();
                None
            }
            RoleAction::Probe { address } => {
                self.spawn_probe(address);
                None
            }
            RoleAction::ConnectUplink { address } => Some(match self.node.join(&address).await {
                Ok(_) => RoleEvent::ConnectSucceeded,
                Err(e) => RoleEvent::ConnectFailed {
                    error: e.to_string(),
                },
            }),
            RoleAction::StartListening => Some(match self.node.become_master().await {
                Ok(address) => RoleEvent::ListenStarted { address },
                Err(e) => RoleEvent::ListenFailed {
                    error: e.to_string(),
                },
            }),
            RoleAction::StopListening => {
                self.node.stop_listening();
                None
            }
            RoleAction::StartRescanTimer => {
                self.arm_rescan();
                None
            }
            RoleAction::CancelRescan => {
                if let Some(timer) = self.rescan.take() {
                    timer.cancel();
                }
                None
            }
            RoleAction::TearDown => {
                self.work.cancel();
                self.work = CancellationToken::new();
                self.node.reset();
                None
            }
            RoleAction::Emit(notice) => {
                match &notice {
                    RoleNotice::RoleEstablished { role, address } => {
                        tracing::info!(role = %role, address = ?address, "role established")
                    }
                    RoleNotice::CandidateRejected { address, error } => {
                        tracing::debug!(address = %address, error = %error, "candidate rejected")
                    }
                    RoleNotice::Failed { error } => tracing::warn!(error = %error, "role failed"),
                    RoleNotice::UplinkLost { reason } => {
                        tracing::warn!(reason = %reason, "uplink lost")
                    }
                }
                let _ = self.notices.send(notice);
                None
            }
        }
    }

    fn spawn_scan(&self) {
        let discovery = Arc::clone(&self.discovery);
        let window = self.settings.scan_window;
        let own = self.node.local_address();
        let events = self.events_tx.clone();
        let cancel = self.work.child_token();

        tokio::spawn(async move {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                result = discovery.scan(window) => match result {
                    Ok(candidates) => RoleEvent::ScanCompleted {
                        // never probe our own listener
                        candidates: candidates
                            .into_iter()
                            .filter(|c| Some(c) != own.as_ref())
                            .collect(),
                    },
                    Err(e) => RoleEvent::ScanFailed { error: e.to_string() },
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn spawn_probe(&self, address: String) {
        let transport = Arc::clone(&self.transport);
        let service = self.service.clone();
        let timeout = self.settings.probe_timeout;
        let events = self.events_tx.clone();
        let cancel = self.work.child_token();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = tokio::time::timeout(timeout, transport.connect(&address, &service)) => outcome,
            };
            let event = match outcome {
                // the probe stream is dropped straight away
                Ok(Ok(_stream)) => RoleEvent::ProbeSucceeded {
                    address,
                    peer_count: 0,
                },
                Ok(Err(e)) => RoleEvent::ProbeFailed {
                    address,
                    error: e.to_string(),
                },
                Err(_) => RoleEvent::ProbeFailed {
                    address,
                    error: "probe timed out".to_string(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn arm_rescan(&mut self) {
        if let Some(previous) = self.rescan.take() {
            previous.cancel();
        }
        let timer = self.work.child_token();
        self.rescan = Some(timer.clone());

        let delay = with_jitter(self.settings.rescan_interval, self.settings.rescan_jitter);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(RoleEvent::RescanTimer { peer_count: 0 }).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryError, StaticDiscovery};
    use crate::node::{NodeConfig, PlaneSettings};
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use async_trait::async_trait;
    use plane_core::Role;
    use plane_types::{DeviceId, ScreenInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            scan_window: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
            rescan_interval: Duration::from_secs(60),
            rescan_jitter: Duration::ZERO,
        }
    }

    fn node(network: &MemoryNetwork, id: &str) -> (Node, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new(network, format!("mem://{id}")));
        let config = NodeConfig::new(
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
        (Node::start(config, transport.clone()), transport)
    }

    async fn wait_for_role(orchestrator: &Orchestrator, role: Role) -> RoleState {
        let mut state = orchestrator.state();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| s.role() == Some(role)),
        )
        .await
        .expect("timed out waiting for role");
        let reached = result.expect("orchestrator gone").clone();
        reached
    }

    struct DeniedDiscovery;

    #[async_trait]
    impl Discovery for DeniedDiscovery {
        async fn scan(&self, _window: Duration) -> Result<Vec<String>, DiscoveryError> {
            Err(DiscoveryError::CapabilityDenied("no radio".into()))
        }
    }

    /// Empty on the first scan; later scans report `other` once released.
    struct HeldDiscovery {
        scans: AtomicUsize,
        other: String,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Discovery for HeldDiscovery {
        async fn scan(&self, _window: Duration) -> Result<Vec<String>, DiscoveryError> {
            if self.scans.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(vec![]);
            }
            self.started.notify_one();
            self.release.notified().await;
            Ok(vec![self.other.clone()])
        }
    }

    #[tokio::test]
    async fn peer_joining_during_rescan_keeps_master() {
        let network = MemoryNetwork::new();
        let (other, _) = node(&network, "x");
        other.become_master().await.unwrap();
        let mut other_events = other.subscribe();

        let discovery = Arc::new(HeldDiscovery {
            scans: AtomicUsize::new(0),
            other: "mem://x".into(),
            started: Notify::new(),
            release: Notify::new(),
        });
        let (master, transport) = node(&network, "a");
        let orchestrator = Orchestrator::start(
            master.clone(),
            transport,
            discovery.clone(),
            OrchestratorSettings {
                rescan_interval: Duration::from_millis(10),
                ..settings()
            },
        );
        wait_for_role(&orchestrator, Role::Master).await;

        // the rescan starts with no peers; one joins before it finishes
        tokio::time::timeout(Duration::from_secs(2), discovery.started.notified())
            .await
            .unwrap();
        let (slave, _) = node(&network, "b");
        slave.join("mem://a").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while master.peer_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        discovery.release.notify_one();

        // the probe reaches x and disconnects again
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(NodeEvent::PeerLeft { .. }) = other_events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(master.role(), Some(Role::Master));
        assert_eq!(master.peer_count(), 1);
        assert_eq!(slave.role(), Some(Role::Slave));
        assert_eq!(other.peer_count(), 0);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn empty_scan_becomes_master() {
        let network = MemoryNetwork::new();
        let (node, transport) = node(&network, "a");
        let orchestrator = Orchestrator::start(
            node.clone(),
            transport,
            Arc::new(network.clone()),
            settings(),
        );

        let state = wait_for_role(&orchestrator, Role::Master).await;
        assert_eq!(state, RoleState::Listening);
        assert_eq!(node.role(), Some(Role::Master));
        assert!(network.is_listening("mem://a"));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn existing_master_is_joined() {
        let network = MemoryNetwork::new();
        let (master, _) = node(&network, "a");
        master.become_master().await.unwrap();

        let (slave, transport) = node(&network, "b");
        let orchestrator = Orchestrator::start(
            slave.clone(),
            transport,
            Arc::new(network.clone()),
            settings(),
        );

        let state = wait_for_role(&orchestrator, Role::Slave).await;
        assert_eq!(
            state,
            RoleState::Connected {
                address: "mem://a".into()
            }
        );
        assert_eq!(slave.role(), Some(Role::Slave));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn unreachable_candidate_falls_back_to_master() {
        let network = MemoryNetwork::new();
        let (node, transport) = node(&network, "a");
        let mut notices = {
            let orchestrator = Orchestrator::start(
                node.clone(),
                transport,
                Arc::new(StaticDiscovery::new(vec!["mem://ghost".into()])),
                settings(),
            );
            let notices = orchestrator.subscribe();
            wait_for_role(&orchestrator, Role::Master).await;
            orchestrator.stop().await;
            notices
        };

        let first = notices.recv().await.unwrap();
        assert!(matches!(first, RoleNotice::CandidateRejected { .. }));
    }

    #[tokio::test]
    async fn denied_scan_fails_to_idle() {
        let network = MemoryNetwork::new();
        let (node, transport) = node(&network, "a");
        let orchestrator =
            Orchestrator::start(node.clone(), transport, Arc::new(DeniedDiscovery), settings());
        let mut notices = orchestrator.subscribe();

        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice, RoleNotice::Failed { .. }));
        assert_eq!(orchestrator.current(), RoleState::Idle);
        assert_eq!(node.role(), None);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let network = MemoryNetwork::new();
        let (node, transport) = node(&network, "a");
        let orchestrator = Orchestrator::start(
            node.clone(),
            transport,
            Arc::new(network.clone()),
            settings(),
        );
        wait_for_role(&orchestrator, Role::Master).await;

        orchestrator.stop().await;
        orchestrator.stop().await;
        assert_eq!(orchestrator.current(), RoleState::Idle);
        assert_eq!(node.role(), None);
    }
}
