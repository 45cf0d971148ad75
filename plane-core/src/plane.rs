//! Virtual plane and the viewport table.
//!
//! [`PlaneEngine`] owns the plane dimensions, the global scale and every
//! device's [`Viewport`]. The viewport table is copy-on-write: snapshots
//! share the current `Arc`, and a mutation clones the table only while a
//! snapshot is still alive, so a reader never observes a half-applied
//! update.

use std::collections::BTreeMap;
use std::sync::Arc;

use plane_types::{DeviceId, PlaneInit};
use serde::Serialize;
use thiserror::Error;

use crate::viewport::{positive, Rect, ScreenRect, Viewport, ViewportPatch};

/// Slack allowed when checking `offset + size <= plane` so that a layout
/// computed as `plane - offset` is not rejected by rounding.
const BOUNDS_EPSILON: f64 = 1e-9;

/// Errors from the coordinate engine.
///
/// Every variant except [`PlaneError::UnknownDevice`] and
/// [`PlaneError::PlaneNotInitialized`] is a configuration error: the call
/// that would have produced the invalid state is rejected and the previous
/// state is kept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaneError {
    /// A dimension, scale or density was zero, negative or not finite.
    #[error("{field} must be positive and finite, got {value}")]
    NonPositive {
        /// Offending field.
        field: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// An offset was negative or not finite.
    #[error("{field} must be non-negative and finite, got {value}")]
    Negative {
        /// Offending field.
        field: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// A viewport would extend past the plane.
    #[error("viewport {device_id} exceeds plane {axis}: {end} > {limit}")]
    OutOfBounds {
        /// Device whose viewport was rejected.
        device_id: DeviceId,
        /// `"width"` or `"height"`.
        axis: &'static str,
        /// `offset + size` on that axis.
        end: f64,
        /// Plane size on that axis.
        limit: f64,
    },

    /// No horizontal space left for a joining device.
    #[error("no free slot for {device_id}: plane is full")]
    NoFreeSlot {
        /// Device that could not be placed.
        device_id: DeviceId,
    },

    /// Operation needs an initialized plane.
    #[error("plane not initialized")]
    PlaneNotInitialized,

    /// No viewport for this device.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
}

impl PlaneError {
    /// Whether this error rejected an invalid configuration.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            PlaneError::PlaneNotInitialized | PlaneError::UnknownDevice(_)
        )
    }
}

/// The shared drawing surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VirtualPlane {
    /// Width in VU
    pub width_vu: f64,
    /// Height in VU
    pub height_vu: f64,
    /// dp per VU, chosen once by the Master
    pub global_scale_dp_per_vu: f64,
}

impl VirtualPlane {
    /// Create a plane, rejecting non-positive values.
    pub fn new(width_vu: f64, height_vu: f64, global_scale_dp_per_vu: f64) -> Result<Self, PlaneError> {
        positive("width_vu", width_vu)?;
        positive("height_vu", height_vu)?;
        positive("global_scale_dp_per_vu", global_scale_dp_per_vu)?;
        Ok(Self {
            width_vu,
            height_vu,
            global_scale_dp_per_vu,
        })
    }

    /// Wire form of this plane.
    pub fn to_init(&self) -> PlaneInit {
        PlaneInit {
            width_vu: self.width_vu,
            height_vu: self.height_vu,
            global_scale_dp_per_vu: self.global_scale_dp_per_vu,
        }
    }

    /// Plane from its wire form.
    pub fn from_init(init: &PlaneInit) -> Result<Self, PlaneError> {
        Self::new(init.width_vu, init.height_vu, init.global_scale_dp_per_vu)
    }

    /// Check that a viewport lies inside the plane.
    pub fn contains(&self, viewport: &Viewport) -> Result<(), PlaneError> {
        let end_x = viewport.offset_x + viewport.width;
        if end_x > self.width_vu + BOUNDS_EPSILON {
            return Err(PlaneError::OutOfBounds {
                device_id: viewport.device_id.clone(),
                axis: "width",
                end: end_x,
                limit: self.width_vu,
            });
        }
        let end_y = viewport.offset_y + viewport.height;
        if end_y > self.height_vu + BOUNDS_EPSILON {
            return Err(PlaneError::OutOfBounds {
                device_id: viewport.device_id.clone(),
                axis: "height",
                end: end_y,
                limit: self.height_vu,
            });
        }
        Ok(())
    }
}

/// Immutable view of the plane and viewport table.
#[derive(Debug, Clone, Default)]
pub struct PlaneSnapshot {
    /// Plane, if initialized
    pub plane: Option<VirtualPlane>,
    /// Viewports keyed by device
    pub viewports: Arc<BTreeMap<DeviceId, Viewport>>,
}

impl PlaneSnapshot {
    /// Look up one device's viewport.
    pub fn viewport(&self, device_id: &DeviceId) -> Option<&Viewport> {
        self.viewports.get(device_id)
    }
}

/// Plane dimensions, global scale and per-device viewports.
#[derive(Debug, Clone, Default)]
pub struct PlaneEngine {
    plane: Option<VirtualPlane>,
    viewports: Arc<BTreeMap<DeviceId, Viewport>>,
}

impl PlaneEngine {
    /// Create an engine with no plane and no viewports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize (or replace) the plane.
    ///
    /// Rejects non-positive values, and any plane that would leave an
    /// existing viewport out of bounds.
    pub fn init_plane(
        &mut self,
        width_vu: f64,
        height_vu: f64,
        global_scale_dp_per_vu: f64,
    ) -> Result<VirtualPlane, PlaneError> {
        let plane = VirtualPlane::new(width_vu, height_vu, global_scale_dp_per_vu)?;
        for viewport in self.viewports.values() {
            plane.contains(viewport)?;
        }
        self.plane = Some(plane);
        Ok(plane)
    }

    /// Current plane, if any.
    pub fn plane(&self) -> Option<VirtualPlane> {
        self.plane
    }

    /// Global scale, or an error if the plane is not initialized.
    pub fn global_scale(&self) -> Result<f64, PlaneError> {
        self.plane
            .map(|p| p.global_scale_dp_per_vu)
            .ok_or(PlaneError::PlaneNotInitialized)
    }

    /// Insert or replace the viewport for `viewport.device_id`.
    pub fn define_viewport(&mut self, viewport: Viewport) -> Result<(), PlaneError> {
        viewport.validate()?;
        if let Some(plane) = &self.plane {
            plane.contains(&viewport)?;
        }
        Arc::make_mut(&mut self.viewports).insert(viewport.device_id.clone(), viewport);
        Ok(())
    }

    /// Merge a patch into an existing viewport.
    pub fn update_viewport(
        &mut self,
        device_id: &DeviceId,
        patch: &ViewportPatch,
    ) -> Result<Viewport, PlaneError> {
        let current = self
            .viewports
            .get(device_id)
            .ok_or_else(|| PlaneError::UnknownDevice(device_id.clone()))?;
        let updated = current.patched(patch);
        self.define_viewport(updated.clone())?;
        Ok(updated)
    }

    /// Remove a device's viewport. Returns it if it existed.
    pub fn remove_viewport(&mut self, device_id: &DeviceId) -> Option<Viewport> {
        if !self.viewports.contains_key(device_id) {
            return None;
        }
        Arc::make_mut(&mut self.viewports).remove(device_id)
    }

    /// Look up one device's viewport.
    pub fn viewport(&self, device_id: &DeviceId) -> Result<&Viewport, PlaneError> {
        self.viewports
            .get(device_id)
            .ok_or_else(|| PlaneError::UnknownDevice(device_id.clone()))
    }

    /// Iterate over every viewport, ordered by device id.
    pub fn viewports(&self) -> impl Iterator<Item = &Viewport> {
        self.viewports.values()
    }

    /// Immutable snapshot (shares the table until the next mutation).
    pub fn snapshot(&self) -> PlaneSnapshot {
        PlaneSnapshot {
            plane: self.plane,
            viewports: Arc::clone(&self.viewports),
        }
    }

    /// Drop the plane and every viewport.
    pub fn clear(&mut self) {
        self.plane = None;
        self.viewports = Arc::new(BTreeMap::new());
    }

    /// Plane point → viewport-local VU.
    pub fn virtual_to_local(&self, device_id: &DeviceId, x: f64, y: f64) -> Result<(f64, f64), PlaneError> {
        Ok(self.viewport(device_id)?.virtual_to_local(x, y))
    }

    /// Viewport-local VU → plane point.
    pub fn local_to_virtual(&self, device_id: &DeviceId, lx: f64, ly: f64) -> Result<(f64, f64), PlaneError> {
        Ok(self.viewport(device_id)?.local_to_virtual(lx, ly))
    }

    /// Plane point → physical pixels on the device.
    pub fn virtual_to_screen(&self, device_id: &DeviceId, x: f64, y: f64) -> Result<(f64, f64), PlaneError> {
        let scale = self.global_scale()?;
        Ok(self.viewport(device_id)?.virtual_to_screen(scale, x, y))
    }

    /// Physical pixels on the device → plane point.
    pub fn screen_to_virtual(&self, device_id: &DeviceId, sx: f64, sy: f64) -> Result<(f64, f64), PlaneError> {
        let scale = self.global_scale()?;
        Ok(self.viewport(device_id)?.screen_to_virtual(scale, sx, sy))
    }

    /// Local drag delta in dp → plane delta in VU.
    pub fn local_delta_to_virtual(
        &self,
        device_id: &DeviceId,
        dx_dp: f64,
        dy_dp: f64,
    ) -> Result<(f64, f64), PlaneError> {
        let scale = self.global_scale()?;
        Ok(self.viewport(device_id)?.local_delta_to_virtual(scale, dx_dp, dy_dp))
    }

    /// Visible, clipped pixel rectangle of a plane rectangle on a device.
    pub fn project_rect(&self, device_id: &DeviceId, rect: Rect) -> Result<Option<ScreenRect>, PlaneError> {
        let scale = self.global_scale()?;
        Ok(self.viewport(device_id)?.project(scale, rect))
    }

    /// VU → dp. Identical on every device sharing the plane.
    pub fn vu_to_dp(&self, vu: f64) -> Result<f64, PlaneError> {
        Ok(vu * self.global_scale()?)
    }

    /// VU → physical pixels on one device.
    pub fn vu_to_px(&self, device_id: &DeviceId, vu: f64) -> Result<f64, PlaneError> {
        Ok(self.vu_to_dp(vu)? * self.viewport(device_id)?.density)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plane_types::Orientation;

    const EPS: f64 = 1e-9;

    fn viewport(id: &str, offset_x: f64, width: f64, density: f64) -> Viewport {
        Viewport {
            device_id: DeviceId::new(id),
            offset_x,
            offset_y: 0.0,
            width,
            height: 1200.0,
            orientation: Orientation::Normal,
            local_screen_width: width * 0.4,
            local_screen_height: 480.0,
            density,
        }
    }

    /// Two tablets side by side on a 2000×1200 plane: A at 1.08 px/VU,
    /// B at 0.72 px/VU with a shared 0.4 dp/VU scale.
    fn reference_engine() -> PlaneEngine {
        let mut engine = PlaneEngine::new();
        engine.init_plane(2000.0, 1200.0, 0.4).unwrap();
        engine.define_viewport(viewport("a", 0.0, 1000.0, 2.7)).unwrap();
        engine.define_viewport(viewport("b", 1000.0, 1000.0, 1.8)).unwrap();
        engine
    }

    #[test]
    fn init_plane_rejects_non_positive() {
        let mut engine = PlaneEngine::new();
        assert!(matches!(
            engine.init_plane(0.0, 100.0, 1.0),
            Err(PlaneError::NonPositive { field: "width_vu", .. })
        ));
        assert!(engine.init_plane(100.0, -1.0, 1.0).is_err());
        assert!(engine.init_plane(100.0, 100.0, f64::INFINITY).is_err());
        assert!(engine.plane().is_none());
    }

    #[test]
    fn rejected_init_keeps_prior_plane() {
        let mut engine = PlaneEngine::new();
        engine.init_plane(2000.0, 1200.0, 0.4).unwrap();
        engine.define_viewport(viewport("a", 1000.0, 1000.0, 2.0)).unwrap();

        let err = engine.init_plane(1500.0, 1200.0, 0.4).unwrap_err();
        assert!(matches!(err, PlaneError::OutOfBounds { axis: "width", .. }));
        assert_eq!(engine.plane().unwrap().width_vu, 2000.0);
    }

    #[test]
    fn define_viewport_validates_bounds() {
        let mut engine = PlaneEngine::new();
        engine.init_plane(2000.0, 1200.0, 0.4).unwrap();

        let err = engine
            .define_viewport(viewport("a", 1500.0, 1000.0, 2.0))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(engine.viewport(&DeviceId::new("a")).is_err());
    }

    #[test]
    fn define_viewport_without_plane_skips_bounds() {
        let mut engine = PlaneEngine::new();
        engine
            .define_viewport(viewport("a", 5000.0, 1000.0, 2.0))
            .unwrap();
        assert_eq!(engine.viewports().count(), 1);
    }

    #[test]
    fn define_viewport_replaces_existing() {
        let mut engine = reference_engine();
        engine.define_viewport(viewport("a", 0.0, 500.0, 3.0)).unwrap();
        let a = engine.viewport(&DeviceId::new("a")).unwrap();
        assert_eq!(a.width, 500.0);
        assert_eq!(engine.viewports().count(), 2);
    }

    #[test]
    fn update_viewport_partial_merge() {
        let mut engine = reference_engine();
        let b = DeviceId::new("b");
        let updated = engine
            .update_viewport(&b, &ViewportPatch::orientation(Orientation::Rotated180))
            .unwrap();
        assert_eq!(updated.orientation, Orientation::Rotated180);
        assert_eq!(updated.offset_x, 1000.0);
        assert_eq!(updated.density, 1.8);
    }

    #[test]
    fn invalid_update_keeps_prior_viewport() {
        let mut engine = reference_engine();
        let b = DeviceId::new("b");
        let err = engine
            .update_viewport(&b, &ViewportPatch::offset(1500.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, PlaneError::OutOfBounds { .. }));
        assert_eq!(engine.viewport(&b).unwrap().offset_x, 1000.0);
    }

    #[test]
    fn update_unknown_device() {
        let mut engine = reference_engine();
        assert!(matches!(
            engine.update_viewport(&DeviceId::new("zz"), &ViewportPatch::default()),
            Err(PlaneError::UnknownDevice(_))
        ));
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutation() {
        let mut engine = reference_engine();
        let before = engine.snapshot();

        engine.remove_viewport(&DeviceId::new("a"));
        engine
            .update_viewport(&DeviceId::new("b"), &ViewportPatch::offset(0.0, 0.0))
            .unwrap();

        assert_eq!(before.viewports.len(), 2);
        assert_eq!(before.viewport(&DeviceId::new("b")).unwrap().offset_x, 1000.0);
        assert_eq!(engine.snapshot().viewports.len(), 1);
    }

    #[test]
    fn screen_transforms_need_plane() {
        let mut engine = PlaneEngine::new();
        engine.define_viewport(viewport("a", 0.0, 100.0, 1.0)).unwrap();
        assert!(matches!(
            engine.virtual_to_screen(&DeviceId::new("a"), 1.0, 1.0),
            Err(PlaneError::PlaneNotInitialized)
        ));
        // local transforms do not
        assert!(engine.virtual_to_local(&DeviceId::new("a"), 1.0, 1.0).is_ok());
    }

    #[test]
    fn uniform_physical_size() {
        let engine = reference_engine();
        let a = DeviceId::new("a");
        let b = DeviceId::new("b");

        // dp size only depends on the shared scale
        assert!((engine.vu_to_dp(200.0).unwrap() - 80.0).abs() < EPS);

        // pixel counts differ by density
        let px_a = engine.vu_to_px(&a, 200.0).unwrap();
        let px_b = engine.vu_to_px(&b, 200.0).unwrap();
        assert!((px_a - 216.0).abs() < EPS);
        assert!((px_b - 144.0).abs() < EPS);
        assert!((px_a / 2.7 - px_b / 1.8).abs() < EPS);
    }

    #[test]
    fn reference_scenario_slices_are_edge_aligned() {
        let engine = reference_engine();
        let a = DeviceId::new("a");
        let b = DeviceId::new("b");
        let object = Rect::new(900.0, 100.0, 200.0, 200.0);

        let on_a = engine.project_rect(&a, object).unwrap().unwrap();
        let on_b = engine.project_rect(&b, object).unwrap().unwrap();

        assert!((on_a.width - 108.0).abs() < 1e-6, "A width {}", on_a.width);
        assert!((on_a.height - 216.0).abs() < 1e-6, "A height {}", on_a.height);
        assert!((on_b.width - 72.0).abs() < 1e-6, "B width {}", on_b.width);
        assert!((on_b.height - 144.0).abs() < 1e-6, "B height {}", on_b.height);

        // A's slice ends exactly where B's begins: x = 1000 VU
        let (a_right, _) = engine
            .screen_to_virtual(&a, on_a.x + on_a.width, on_a.y)
            .unwrap();
        let (b_left, _) = engine.screen_to_virtual(&b, on_b.x, on_b.y).unwrap();
        assert!((a_right - 1000.0).abs() < 1e-9);
        assert!((b_left - 1000.0).abs() < 1e-9);
        assert!((a_right - b_left).abs() < 1e-9);
    }

    #[test]
    fn screen_round_trip_through_engine() {
        let engine = reference_engine();
        let b = DeviceId::new("b");
        let (sx, sy) = engine.virtual_to_screen(&b, 1234.5, 678.9).unwrap();
        let (x, y) = engine.screen_to_virtual(&b, sx, sy).unwrap();
        assert!((x - 1234.5).abs() < EPS && (y - 678.9).abs() < EPS);
    }

    #[test]
    fn clear_drops_everything() {
        let mut engine = reference_engine();
        engine.clear();
        assert!(engine.plane().is_none());
        assert_eq!(engine.viewports().count(), 0);
    }
}
