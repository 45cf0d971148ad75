//! Transport abstraction for shareplane.
//!
//! A transport turns an address into a reliable, ordered, bidirectional
//! byte stream, and opens listeners that accept such streams under a named
//! service. Framing lives above this layer (see [`plane_types::frame`]).
//!
//! # Design
//!
//! - `listen()` opens a [`Listener`] reachable under a service id
//! - `Listener::accept()` yields one [`Accepted`] stream per remote peer
//! - `connect()` opens a stream to a listener, checking the service id
//! - dropping a stream or listener closes it
//!
//! Two implementations ship with the crate: [`MemoryTransport`] (in-process,
//! deterministic, with failure injection) and [`TcpTransport`].
//!
//! # Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let master = MemoryTransport::new(&network, "mem://master");
//! let mut listener = master.listen(&ServiceId::default()).await?;
//! let slave = MemoryTransport::new(&network, "mem://slave");
//! let stream = slave.connect("mem://master", &ServiceId::default()).await?;
//! ```

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use plane_types::ServiceId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Listener could not be opened.
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// Remote side listens under a different service.
    #[error("service mismatch: expected {expected}, remote offered {actual}")]
    ServiceMismatch {
        /// Service we asked for.
        expected: String,
        /// Service the remote side answered with.
        actual: String,
    },

    /// Listener or stream closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,

    /// The platform refused the operation (missing permission or radio).
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional byte stream to one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed [`PeerStream`], as handed out by every transport.
pub type BoxStream = Box<dyn PeerStream>;

/// One accepted inbound stream.
pub struct Accepted {
    /// Address of the remote endpoint, used as its peer id.
    pub address: String,
    /// The stream itself.
    pub stream: BoxStream,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// An open listener. Dropping it stops accepting.
#[async_trait]
pub trait Listener: Send {
    /// Address other devices can connect to.
    fn local_address(&self) -> String;

    /// Wait for the next inbound stream.
    ///
    /// Errors for a single bad inbound connection are reported as
    /// [`TransportError::ServiceMismatch`] or [`TransportError::Io`] and the
    /// listener stays usable; [`TransportError::ConnectionClosed`] means the
    /// listener is gone for good.
    async fn accept(&mut self) -> Result<Accepted, TransportError>;
}

/// Transport trait for opening listeners and outbound streams.
///
/// Implementations handle the underlying connection mechanism
/// (in-process pipes, TCP, platform radios, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a listener reachable under `service`.
    async fn listen(&self, service: &ServiceId) -> Result<Box<dyn Listener>, TransportError>;

    /// Open a stream to the listener at `address`, which must be listening
    /// under `service`.
    async fn connect(&self, address: &str, service: &ServiceId) -> Result<BoxStream, TransportError>;
}
