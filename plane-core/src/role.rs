//! Role negotiation state machine for shareplane.
//!
//! Decides whether this device joins an existing Master as a Slave or
//! becomes the Master itself. Like the rest of this crate it performs no
//! I/O: [`RoleState::on_event`] takes an event and returns the next state
//! plus a list of [`RoleAction`]s for the driver in `plane-link` to execute.
//!
//! ```text
//! IDLE → SCANNING → TESTING_CANDIDATES → CONNECTING → CONNECTED
//!            │              │                 │            │
//!            └──────────────┴─────→ SERVER_MODE ←──────────┘
//!                                        │
//!                                    LISTENING ⇄ RESCANNING
//! ```
//!
//! A failed connect never goes back to scanning; it falls through to
//! server mode. While listening with zero peers the driver periodically
//! rescans, and a validated candidate found that way hands the device over
//! to the existing Master, unless a peer has joined in the meantime.

use std::time::Duration;

use serde::Serialize;

/// Which side of the star this device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Hub: listens, owns the authoritative state.
    Master,
    /// Spoke: one uplink to the Master.
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// Role negotiation state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoleState {
    /// Nothing running.
    #[default]
    Idle,
    /// Initial discovery scan in progress.
    Scanning,
    /// Probing discovered candidates one at a time.
    TestingCandidates {
        /// Candidate being probed.
        current: String,
        /// Candidates not yet tried, in discovery order.
        remaining: Vec<String>,
    },
    /// Opening the uplink to a validated Master.
    Connecting {
        /// Master address.
        address: String,
    },
    /// Slave with an open uplink.
    Connected {
        /// Master address.
        address: String,
    },
    /// Committed to Master, listener not yet open.
    ServerMode,
    /// Master with an open listener.
    Listening,
    /// Master with an open listener, probing candidates from a rescan.
    Rescanning {
        /// Candidate being probed.
        current: String,
        /// Candidates not yet tried.
        remaining: Vec<String>,
    },
}

impl RoleState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// Unexpected events leave the state unchanged and produce no actions.
    pub fn on_event(self, event: RoleEvent) -> (Self, Vec<RoleAction>) {
        match (self, event) {
            // Stop wins from anywhere, including Idle
            (_, RoleEvent::Stop) => (
                Self::Idle,
                vec![RoleAction::TearDown, RoleAction::CancelRescan],
            ),

            // From Idle
            (Self::Idle, RoleEvent::Start) => (Self::Scanning, vec![RoleAction::StartScan]),

            // From Scanning
            (Self::Scanning, RoleEvent::ScanCompleted { candidates }) => {
                match next_candidate(candidates) {
                    Some((current, remaining)) => (
                        Self::TestingCandidates {
                            current: current.clone(),
                            remaining,
                        },
                        vec![RoleAction::Probe { address: current }],
                    ),
                    None => (Self::ServerMode, vec![RoleAction::StartListening]),
                }
            }
            (Self::Scanning, RoleEvent::ScanFailed { error }) => (
                Self::Idle,
                vec![RoleAction::Emit(RoleNotice::Failed { error })],
            ),

            // From TestingCandidates
            (
                Self::TestingCandidates { current, .. },
                RoleEvent::ProbeSucceeded { address, .. },
            ) if address == current =>
            {
                (
                    Self::Connecting {
                        address: address.clone(),
                    },
                    vec![RoleAction::ConnectUplink { address }],
                )
            }
            (
                Self::TestingCandidates { current, remaining },
                RoleEvent::ProbeFailed { address, error },
            ) if address == current => {
                let rejected = RoleAction::Emit(RoleNotice::CandidateRejected { address, error });
                match next_candidate(remaining) {
                    Some((current, remaining)) => (
                        Self::TestingCandidates {
                            current: current.clone(),
                            remaining,
                        },
                        vec![rejected, RoleAction::Probe { address: current }],
                    ),
                    None => (
                        Self::ServerMode,
                        vec![rejected, RoleAction::StartListening],
                    ),
                }
            }

            // From Connecting
            (Self::Connecting { address }, RoleEvent::ConnectSucceeded) => (
                Self::Connected {
                    address: address.clone(),
                },
                vec![RoleAction::Emit(RoleNotice::RoleEstablished {
                    role: Role::Slave,
                    address: Some(address),
                })],
            ),
            (Self::Connecting { address }, RoleEvent::ConnectFailed { error }) => (
                Self::ServerMode,
                vec![
                    RoleAction::Emit(RoleNotice::CandidateRejected { address, error }),
                    RoleAction::StartListening,
                ],
            ),

            // From Connected
            (Self::Connected { .. }, RoleEvent::UplinkLost { reason }) => (
                Self::ServerMode,
                vec![
                    RoleAction::Emit(RoleNotice::UplinkLost { reason }),
                    RoleAction::StartListening,
                ],
            ),

            // From ServerMode
            (Self::ServerMode, RoleEvent::ListenStarted { address }) => (
                Self::Listening,
                vec![
                    RoleAction::Emit(RoleNotice::RoleEstablished {
                        role: Role::Master,
                        address: Some(address),
                    }),
                    RoleAction::StartRescanTimer,
                ],
            ),
            (Self::ServerMode, RoleEvent::ListenFailed { error }) => (
                Self::Idle,
                vec![RoleAction::Emit(RoleNotice::Failed { error })],
            ),

            // From Listening
            (Self::Listening, RoleEvent::RescanTimer { peer_count: 0 }) => {
                (Self::Listening, vec![RoleAction::Rescan])
            }
            (Self::Listening, RoleEvent::RescanTimer { .. }) => {
                (Self::Listening, vec![RoleAction::StartRescanTimer])
            }
            (Self::Listening, RoleEvent::ScanCompleted { candidates }) => {
                match next_candidate(candidates) {
                    Some((current, remaining)) => (
                        Self::Rescanning {
                            current: current.clone(),
                            remaining,
                        },
                        vec![RoleAction::Probe { address: current }],
                    ),
                    None => (Self::Listening, vec![RoleAction::StartRescanTimer]),
                }
            }
            (Self::Listening, RoleEvent::ScanFailed { error }) => (
                Self::Listening,
                vec![RoleAction::Emit(RoleNotice::Failed { error })],
            ),
            (Self::Listening, RoleEvent::ListenFailed { error }) => (
                Self::Idle,
                vec![
                    RoleAction::Emit(RoleNotice::Failed { error }),
                    RoleAction::CancelRescan,
                    RoleAction::TearDown,
                ],
            ),

            // From Rescanning
            // peers joined while the rescan ran: keep serving them
            (
                Self::Rescanning { current, .. },
                RoleEvent::ProbeSucceeded { address, peer_count },
            ) if address == current && peer_count > 0 => {
                (Self::Listening, vec![RoleAction::StartRescanTimer])
            }
            (Self::Rescanning { current, .. }, RoleEvent::ProbeSucceeded { address, .. })
                if address == current =>
            {
                (
                    Self::Connecting {
                        address: address.clone(),
                    },
                    vec![
                        RoleAction::StopListening,
                        RoleAction::ConnectUplink { address },
                    ],
                )
            }
            (Self::Rescanning { current, remaining }, RoleEvent::ProbeFailed { address, error })
                if address == current =>
            {
                let rejected = RoleAction::Emit(RoleNotice::CandidateRejected { address, error });
                match next_candidate(remaining) {
                    Some((current, remaining)) => (
                        Self::Rescanning {
                            current: current.clone(),
                            remaining,
                        },
                        vec![rejected, RoleAction::Probe { address: current }],
                    ),
                    None => (
                        Self::Listening,
                        vec![rejected, RoleAction::StartRescanTimer],
                    ),
                }
            }
            (Self::Rescanning { .. }, RoleEvent::ListenFailed { error }) => (
                Self::Idle,
                vec![
                    RoleAction::Emit(RoleNotice::Failed { error }),
                    RoleAction::CancelRescan,
                    RoleAction::TearDown,
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// The role this state has committed to, if any.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Connected { .. } => Some(Role::Slave),
            Self::Listening | Self::Rescanning { .. } => Some(Role::Master),
            _ => None,
        }
    }

    /// Whether negotiation is still in progress.
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            Self::Scanning
                | Self::TestingCandidates { .. }
                | Self::Connecting { .. }
                | Self::ServerMode
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::TestingCandidates { .. } => "TESTING_CANDIDATES",
            Self::Connecting { .. } => "CONNECTING",
            Self::Connected { .. } => "CONNECTED",
            Self::ServerMode => "SERVER_MODE",
            Self::Listening => "LISTENING",
            Self::Rescanning { .. } => "RESCANNING",
        }
    }
}

fn next_candidate(candidates: Vec<String>) -> Option<(String, Vec<String>)> {
    let mut candidates = candidates.into_iter();
    let current = candidates.next()?;
    Some((current, candidates.collect()))
}

/// Inputs to the role machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleEvent {
    /// Begin negotiation.
    Start,
    /// Discovery window elapsed.
    ScanCompleted {
        /// Discovered addresses, in discovery order.
        candidates: Vec<String>,
    },
    /// Discovery could not run at all (e.g. capability missing).
    ScanFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Candidate answered the probe under the service id.
    ProbeSucceeded {
        /// Probed address.
        address: String,
        /// Peers connected to this device when the result is applied.
        peer_count: usize,
    },
    /// Candidate did not answer the probe.
    ProbeFailed {
        /// Probed address.
        address: String,
        /// Error message describing the failure.
        error: String,
    },
    /// Uplink open.
    ConnectSucceeded,
    /// Uplink could not be opened.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Listener open.
    ListenStarted {
        /// Address other devices can connect to.
        address: String,
    },
    /// Listener could not be opened, or died.
    ListenFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Rescan interval elapsed.
    RescanTimer {
        /// Peers currently connected to this Master.
        peer_count: usize,
    },
    /// Slave uplink closed or failed.
    UplinkLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Tear everything down.
    Stop,
}

/// Instructions for the driver. These are not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleAction {
    /// Run the initial discovery scan.
    StartScan,
    /// Connect-and-close against a candidate.
    Probe {
        /// Address to probe.
        address: String,
    },
    /// Open the Slave uplink.
    ConnectUplink {
        /// Master address.
        address: String,
    },
    /// Open the Master listener.
    StartListening,
    /// Close the Master listener and every peer.
    StopListening,
    /// Arm the (jittered) rescan timer.
    StartRescanTimer,
    /// Run a discovery scan while staying Master.
    Rescan,
    /// Disarm the rescan timer.
    CancelRescan,
    /// Close every connection and clear all state.
    TearDown,
    /// Report something to the application.
    Emit(RoleNotice),
}

/// Notices emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleNotice {
    /// A role has been committed to.
    RoleEstablished {
        /// The role.
        role: Role,
        /// Uplink address (Slave) or listen address (Master).
        address: Option<String>,
    },
    /// A candidate was excluded.
    CandidateRejected {
        /// Candidate address.
        address: String,
        /// Error message describing the failure.
        error: String,
    },
    /// No role could be established.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// The Slave uplink went away.
    UplinkLost {
        /// Reason for disconnection.
        reason: String,
    },
}

/// Add up to `max_jitter` of random delay to `base`.
///
/// Spreads rescans of devices started at the same moment so they do not
/// probe each other in lockstep. Falls back to no jitter if the OS random
/// source is unavailable.
pub fn with_jitter(base: Duration, max_jitter: Duration) -> Duration {
    let max_ms = max_jitter.as_millis() as u64;
    if max_ms == 0 {
        return base;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => base + Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1)),
        Err(_) => base,
    }
}
