//! # plane-core
//!
//! Pure logic for shareplane (no I/O, instant tests).
//!
//! This crate implements the coordinate engine, the object table and the
//! role negotiation state machine without any network access, so the
//! interesting invariants can be tested synchronously.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`plane`] maps between plane coordinates, viewport-local coordinates and
//!   physical screen pixels
//! - [`store`] applies object records and reports whether anything changed
//! - [`role`] decides Master vs Slave from discovery/probe/connect outcomes
//! - [`coalesce`] merges bursts of drag updates
//!
//! The actual I/O (streams, timers) is performed by `plane-link`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coalesce;
pub mod layout;
pub mod plane;
pub mod role;
pub mod store;
pub mod viewport;

pub use coalesce::DragCoalescer;
pub use layout::place_viewport;
pub use plane::{PlaneEngine, PlaneError, PlaneSnapshot, VirtualPlane};
pub use role::{with_jitter, Role, RoleAction, RoleEvent, RoleNotice, RoleState};
pub use store::{Authority, ObjectStore, SyncObject};
pub use viewport::{Rect, ScreenRect, Viewport, ViewportPatch};
