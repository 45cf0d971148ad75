//! # plane-types
//!
//! Wire format types for the shareplane shared-surface protocol.
//!
//! This crate provides the foundational types used across all shareplane crates:
//! - [`DeviceId`], [`PeerId`], [`ServiceId`] - Identity types
//! - [`Record`] - Protocol records (Hello, PlaneInit, ViewportAssign, ObjectUpdate, ...)
//! - [`frame`] - Length-prefixed framing over any async byte stream
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub mod frame;
mod ids;
mod records;

pub use error::WireError;
pub use frame::{Encoding, ReadOutcome, MAX_FRAME_SIZE};
pub use ids::{DeviceId, PeerId, ServiceId, DEFAULT_SERVICE_ID};
pub use records::{
    Action, Bye, Hello, ObjectUpdate, Orientation, PlaneInit, Record, ScreenInfo,
    ViewportAssign, ViewportRelease, PROTOCOL_VERSION,
};
