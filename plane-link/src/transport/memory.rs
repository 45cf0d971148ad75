//! In-process transport for testing.
//!
//! Every [`MemoryTransport`] sharing a [`MemoryNetwork`] can reach the
//! others' listeners by address. Streams are `tokio::io::duplex` pipes, so
//! framing, back-pressure and EOF behave like a real socket without any
//! I/O. Failures can be injected per transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use plane_types::{ServiceId, MAX_FRAME_SIZE};
use tokio::sync::mpsc;

use super::{Accepted, BoxStream, Listener, Transport, TransportError};

/// Pipe buffer per direction; room for two maximum-size frames.
const DUPLEX_CAPACITY: usize = 2 * (MAX_FRAME_SIZE + 4);

/// Pending inbound connections per listener.
const ACCEPT_BACKLOG: usize = 32;

/// Shared address space for memory transports.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, Registration>>,
    next_listener: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Registration {
    id: u64,
    service: ServiceId,
    incoming: mpsc::Sender<Accepted>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses with an open listener, sorted.
    pub fn listening_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.listeners.iter().map(|e| e.key().clone()).collect();
        addresses.sort();
        addresses
    }

    /// Whether `address` has an open listener.
    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.contains_key(address)
    }
}

/// Memory transport bound to one address on a [`MemoryNetwork`].
///
/// Clones share the same address and failure-injection state.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
    faults: Arc<Mutex<Faults>>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_connect: Option<String>,
    fail_next_listen: Option<String>,
    denied: Option<String>,
}

impl MemoryTransport {
    /// Create a transport that listens (and identifies itself) as `address`.
    pub fn new(network: &MemoryNetwork, address: impl Into<String>) -> Self {
        Self {
            network: network.clone(),
            address: address.into(),
            faults: Arc::default(),
        }
    }

    /// This transport's own address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.faults().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next listen() to fail with the given error.
    pub fn fail_next_listen(&self, error: &str) {
        self.faults().fail_next_listen = Some(error.to_string());
    }

    /// Refuse every operation with a capability error until cleared.
    pub fn deny(&self, reason: Option<&str>) {
        self.faults().denied = reason.map(str::to_string);
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, service: &ServiceId) -> Result<Box<dyn Listener>, TransportError> {
        {
            let mut faults = self.faults();
            if let Some(reason) = &faults.denied {
                return Err(TransportError::CapabilityDenied(reason.clone()));
            }
            if let Some(error) = faults.fail_next_listen.take() {
                return Err(TransportError::ListenFailed(error));
            }
        }

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let id = self.network.next_listener.fetch_add(1, Ordering::Relaxed);
        match self.network.listeners.entry(self.address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::ListenFailed(format!(
                    "address in use: {}",
                    self.address
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Registration {
                    id,
                    service: service.clone(),
                    incoming: tx,
                });
            }
        }

        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            address: self.address.clone(),
            id,
            incoming: rx,
        }))
    }

    async fn connect(&self, address: &str, service: &ServiceId) -> Result<BoxStream, TransportError> {
        {
            let mut faults = self.faults();
            if let Some(reason) = &faults.denied {
                return Err(TransportError::CapabilityDenied(reason.clone()));
            }
            if let Some(error) = faults.fail_next_connect.take() {
                return Err(TransportError::ConnectionFailed(error));
            }
        }

        let (offered, incoming) = match self.network.listeners.get(address) {
            Some(registration) => (registration.service.clone(), registration.incoming.clone()),
            None => {
                return Err(TransportError::ConnectionFailed(format!(
                    "no listener at {address}"
                )))
            }
        };
        if &offered != service {
            return Err(TransportError::ServiceMismatch {
                expected: service.to_string(),
                actual: offered.to_string(),
            });
        }

        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        incoming
            .send(Accepted {
                address: self.address.clone(),
                stream: Box::new(remote),
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("listener at {address} closed")))?;
        Ok(Box::new(local))
    }
}

struct MemoryListener {
    network: MemoryNetwork,
    address: String,
    id: u64,
    incoming: mpsc::Receiver<Accepted>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn accept(&mut self) -> Result<Accepted, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::ConnectionClosed)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let id = self.id;
        self.network
            .listeners
            .remove_if(&self.address, |_, registration| registration.id == id);
    }
}
