//! Protocol records for shareplane.
//!
//! Every record travels as one frame (see [`crate::frame`]). Handshake
//! records flow Master → Slave once per join; [`ObjectUpdate`] flows in
//! either direction and is relayed by the Master.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, ServiceId};

/// Protocol version carried in [`Hello`].
pub const PROTOCOL_VERSION: u8 = 1;

/// All possible protocol records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    /// Slave introduces itself after connecting
    Hello(Hello),
    /// Plane dimensions and the shared scale
    PlaneInit(PlaneInit),
    /// Viewport geometry for one device
    ViewportAssign(ViewportAssign),
    /// A device left; its viewport is gone
    ViewportRelease(ViewportRelease),
    /// Object added, moved or removed
    ObjectUpdate(ObjectUpdate),
    /// Graceful disconnect
    Bye(Bye),
}

impl Record {
    /// Short name of the record kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Hello(_) => "Hello",
            Record::PlaneInit(_) => "PlaneInit",
            Record::ViewportAssign(_) => "ViewportAssign",
            Record::ViewportRelease(_) => "ViewportRelease",
            Record::ObjectUpdate(_) => "ObjectUpdate",
            Record::Bye(_) => "Bye",
        }
    }
}

impl From<ObjectUpdate> for Record {
    fn from(update: ObjectUpdate) -> Self {
        Record::ObjectUpdate(update)
    }
}

/// Fixed coordinate remapping applied when projecting the plane into a
/// viewport's local frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Orientation {
    /// Identity
    #[default]
    Normal,
    /// Quarter turn
    #[serde(rename = "ROTATED_90")]
    Rotated90,
    /// Half turn
    #[serde(rename = "ROTATED_180")]
    Rotated180,
    /// Three-quarter turn
    #[serde(rename = "ROTATED_270")]
    Rotated270,
    /// Mirrored horizontally
    FlippedX,
    /// Mirrored vertically
    FlippedY,
}

impl Orientation {
    /// All six orientations.
    pub const ALL: [Orientation; 6] = [
        Orientation::Normal,
        Orientation::Rotated90,
        Orientation::Rotated180,
        Orientation::Rotated270,
        Orientation::FlippedX,
        Orientation::FlippedY,
    ];

    /// Whether the local frame has its axes swapped relative to the plane.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Orientation::Rotated90 | Orientation::Rotated270)
    }
}

impl std::str::FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "0" => Ok(Orientation::Normal),
            "rotated_90" | "rotated90" | "90" => Ok(Orientation::Rotated90),
            "rotated_180" | "rotated180" | "180" => Ok(Orientation::Rotated180),
            "rotated_270" | "rotated270" | "270" => Ok(Orientation::Rotated270),
            "flipped_x" | "flippedx" => Ok(Orientation::FlippedX),
            "flipped_y" | "flippedy" => Ok(Orientation::FlippedY),
            other => Err(format!("unknown orientation: {other}")),
        }
    }
}

/// Physical description of a device screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenInfo {
    /// Width in device-independent units
    pub width_dp: f64,
    /// Height in device-independent units
    pub height_dp: f64,
    /// Physical pixels per device-independent unit
    pub density: f64,
}

/// Sent by a Slave immediately after its uplink opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Service the Slave expects to be talking to
    pub service: ServiceId,
    /// Identity of the joining device
    pub device_id: DeviceId,
    /// Screen the joining device renders on
    pub screen: ScreenInfo,
}

/// Plane dimensions and the Master-chosen global scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaneInit {
    /// Plane width in VU
    pub width_vu: f64,
    /// Plane height in VU
    pub height_vu: f64,
    /// Device-independent units per VU, identical on every device
    pub global_scale_dp_per_vu: f64,
}

/// Viewport geometry for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportAssign {
    /// Device the viewport belongs to
    pub device_id: DeviceId,
    /// Left edge in VU
    pub offset_x: f64,
    /// Top edge in VU
    pub offset_y: f64,
    /// Width in VU
    pub width: f64,
    /// Height in VU
    pub height: f64,
    /// Local frame orientation
    pub orientation: Orientation,
}

/// A device left the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportRelease {
    /// Device whose viewport was removed
    pub device_id: DeviceId,
}

/// What an [`ObjectUpdate`] does to the object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Action {
    /// Create (or overwrite) an object
    Add = 1,
    /// Reposition (or create) an object
    Move = 2,
    /// Delete an object
    Remove = 3,
}

impl TryFrom<u8> for Action {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Action::Add),
            2 => Ok(Action::Move),
            3 => Ok(Action::Remove),
            _ => Err(crate::WireError::InvalidAction(value)),
        }
    }
}

/// Steady-state object mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    /// Object identifier
    pub id: String,
    /// Left edge in VU
    pub x: f64,
    /// Top edge in VU
    pub y: f64,
    /// Width in VU
    pub width: f64,
    /// Height in VU
    pub height: f64,
    /// Mutation kind
    pub action: Action,
}

impl ObjectUpdate {
    /// Build an ADD update.
    pub fn add(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            width,
            height,
            action: Action::Add,
        }
    }

    /// Build a MOVE update.
    pub fn moved(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            action: Action::Move,
            ..Self::add(id, x, y, width, height)
        }
    }

    /// Build a REMOVE update. Geometry is zeroed.
    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            action: Action::Remove,
            ..Self::add(id, 0.0, 0.0, 0.0, 0.0)
        }
    }
}

/// Graceful disconnect record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    /// Optional reason for disconnect
    pub reason: Option<String>,
}
