//! # plane-link
//!
//! Networking half of shareplane: streams, the star-topology broker, the
//! per-device session runtime and the role orchestrator.
//!
//! ## Features
//!
//! - **Transport Abstraction**: Pluggable transport layer (TCP, in-memory)
//! - **Star Broker**: Master fans records out to every peer except the sender
//! - **Session Runtime**: [`Node`] keeps the plane, viewports and objects in sync
//! - **Role Negotiation**: [`Orchestrator`] drives the pure `plane-core`
//!   role machine against real discovery and connections
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use plane_link::{Config, Node, Orchestrator, StaticDiscovery, TcpTransport};
//!
//! let config = Config::from_file("shareplane.toml".as_ref())?;
//! let transport = Arc::new(TcpTransport::new(&config.link.bind_address));
//! let node = Node::start(config.to_node_config()?, transport.clone());
//! let orchestrator = Orchestrator::start(
//!     node.clone(),
//!     transport,
//!     Arc::new(StaticDiscovery::new(config.discovery.candidates.clone())),
//!     config.orchestrator_settings(),
//! );
//!
//! node.add_object("card", Rect::new(100.0, 100.0, 50.0, 30.0)).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod config;
mod connection;
pub mod discovery;
pub mod node;
pub mod orchestrator;
pub mod transport;

pub use broker::{Broker, BrokerError, BrokerEvent, BrokerSettings};
pub use config::{Config, ConfigError};
pub use discovery::{Discovery, DiscoveryError, StaticDiscovery};
pub use node::{Node, NodeConfig, NodeError, NodeEvent, NodeSnapshot, PlaneSettings};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use transport::{
    Accepted, BoxStream, Listener, MemoryNetwork, MemoryTransport, TcpTransport, Transport,
    TransportError,
};
