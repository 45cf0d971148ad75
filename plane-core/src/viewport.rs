//! Viewport geometry and the orientation transforms.
//!
//! A viewport is the rectangle of the plane (in VU) that one device shows.
//! Plane coordinates are first made relative to the viewport's top-left
//! corner, then remapped by the viewport's [`Orientation`]:
//!
//! | Orientation   | local (x, y)          |
//! |---------------|-----------------------|
//! | `NORMAL`      | `(rx, ry)`            |
//! | `ROTATED_90`  | `(height - ry, rx)`   |
//! | `ROTATED_180` | `(width - rx, height - ry)` |
//! | `ROTATED_270` | `(ry, width - rx)`    |
//! | `FLIPPED_X`   | `(width - rx, ry)`    |
//! | `FLIPPED_Y`   | `(rx, height - ry)`   |
//!
//! Screen pixels are local VU scaled by `density * global_scale`.

use plane_types::{DeviceId, Orientation, ScreenInfo, ViewportAssign};
use serde::Serialize;

use crate::plane::PlaneError;

/// Axis-aligned rectangle in VU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    /// Left edge
    pub x: f64,
    /// Top edge
    pub y: f64,
    /// Width
    pub width: f64,
    /// Height
    pub height: f64,
}

impl Rect {
    /// Create a rectangle.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Rectangle in physical screen pixels, clipped to the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScreenRect {
    /// Left edge in px
    pub x: f64,
    /// Top edge in px
    pub y: f64,
    /// Width in px (never negative)
    pub width: f64,
    /// Height in px (never negative)
    pub height: f64,
}

/// One device's window onto the plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Viewport {
    /// Owning device
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
    /// Local screen width in dp
    pub local_screen_width: f64,
    /// Local screen height in dp
    pub local_screen_height: f64,
    /// Physical pixels per dp
    pub density: f64,
}

/// Partial viewport update. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewportPatch {
    /// New left edge
    pub offset_x: Option<f64>,
    /// New top edge
    pub offset_y: Option<f64>,
    /// New width
    pub width: Option<f64>,
    /// New height
    pub height: Option<f64>,
    /// New orientation
    pub orientation: Option<Orientation>,
    /// New local screen width
    pub local_screen_width: Option<f64>,
    /// New local screen height
    pub local_screen_height: Option<f64>,
    /// New density
    pub density: Option<f64>,
}

impl ViewportPatch {
    /// Patch that only changes the orientation.
    pub fn orientation(orientation: Orientation) -> Self {
        Self {
            orientation: Some(orientation),
            ..Self::default()
        }
    }

    /// Patch that only moves the viewport.
    pub fn offset(offset_x: f64, offset_y: f64) -> Self {
        Self {
            offset_x: Some(offset_x),
            offset_y: Some(offset_y),
            ..Self::default()
        }
    }
}

impl Viewport {
    /// Build a full viewport from an assignment and the screen it renders on.
    pub fn from_assign(assign: &ViewportAssign, screen: ScreenInfo) -> Self {
        Self {
            device_id: assign.device_id.clone(),
            offset_x: assign.offset_x,
            offset_y: assign.offset_y,
            width: assign.width,
            height: assign.height,
            orientation: assign.orientation,
            local_screen_width: screen.width_dp,
            local_screen_height: screen.height_dp,
            density: screen.density,
        }
    }

    /// The wire assignment for this viewport.
    pub fn to_assign(&self) -> ViewportAssign {
        ViewportAssign {
            device_id: self.device_id.clone(),
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            width: self.width,
            height: self.height,
            orientation: self.orientation,
        }
    }

    /// Screen description this viewport was built from.
    pub fn screen(&self) -> ScreenInfo {
        ScreenInfo {
            width_dp: self.local_screen_width,
            height_dp: self.local_screen_height,
            density: self.density,
        }
    }

    /// Merge a patch into a copy of this viewport.
    pub fn patched(&self, patch: &ViewportPatch) -> Self {
        Self {
            device_id: self.device_id.clone(),
            offset_x: patch.offset_x.unwrap_or(self.offset_x),
            offset_y: patch.offset_y.unwrap_or(self.offset_y),
            width: patch.width.unwrap_or(self.width),
            height: patch.height.unwrap_or(self.height),
            orientation: patch.orientation.unwrap_or(self.orientation),
            local_screen_width: patch.local_screen_width.unwrap_or(self.local_screen_width),
            local_screen_height: patch.local_screen_height.unwrap_or(self.local_screen_height),
            density: patch.density.unwrap_or(self.density),
        }
    }

    /// Check the standalone invariants (positivity, non-negative offsets).
    pub fn validate(&self) -> Result<(), PlaneError> {
        non_negative("offset_x", self.offset_x)?;
        non_negative("offset_y", self.offset_y)?;
        positive("width", self.width)?;
        positive("height", self.height)?;
        positive("local_screen_width", self.local_screen_width)?;
        positive("local_screen_height", self.local_screen_height)?;
        positive("density", self.density)?;
        Ok(())
    }

    /// Extent of the local frame in VU. Quarter turns swap the axes.
    pub fn local_extent(&self) -> (f64, f64) {
        if self.orientation.swaps_axes() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Map a plane point into this viewport's local frame (VU).
    pub fn virtual_to_local(&self, x: f64, y: f64) -> (f64, f64) {
        let rx = x - self.offset_x;
        let ry = y - self.offset_y;
        let (w, h) = (self.width, self.height);
        match self.orientation {
            Orientation::Normal => (rx, ry),
            Orientation::Rotated90 => (h - ry, rx),
            Orientation::Rotated180 => (w - rx, h - ry),
            Orientation::Rotated270 => (ry, w - rx),
            Orientation::FlippedX => (w - rx, ry),
            Orientation::FlippedY => (rx, h - ry),
        }
    }

    /// Inverse of [`Viewport::virtual_to_local`].
    pub fn local_to_virtual(&self, lx: f64, ly: f64) -> (f64, f64) {
        let (w, h) = (self.width, self.height);
        let (rx, ry) = match self.orientation {
            Orientation::Normal => (lx, ly),
            Orientation::Rotated90 => (ly, h - lx),
            Orientation::Rotated180 => (w - lx, h - ly),
            Orientation::Rotated270 => (w - ly, lx),
            Orientation::FlippedX => (w - lx, ly),
            Orientation::FlippedY => (lx, h - ly),
        };
        (rx + self.offset_x, ry + self.offset_y)
    }

    /// Physical pixels per VU for a given global scale.
    pub fn px_per_vu(&self, global_scale: f64) -> f64 {
        self.density * global_scale
    }

    /// Map a plane point to physical screen pixels.
    pub fn virtual_to_screen(&self, global_scale: f64, x: f64, y: f64) -> (f64, f64) {
        let (lx, ly) = self.virtual_to_local(x, y);
        let k = self.px_per_vu(global_scale);
        (lx * k, ly * k)
    }

    /// Inverse of [`Viewport::virtual_to_screen`].
    pub fn screen_to_virtual(&self, global_scale: f64, sx: f64, sy: f64) -> (f64, f64) {
        let lx = sx / self.density / global_scale;
        let ly = sy / self.density / global_scale;
        self.local_to_virtual(lx, ly)
    }

    /// Convert a drag delta in local dp into a plane delta in VU.
    ///
    /// The transforms are affine, so a vector maps as the difference of two
    /// mapped points.
    pub fn local_delta_to_virtual(&self, global_scale: f64, dx_dp: f64, dy_dp: f64) -> (f64, f64) {
        let (ox, oy) = self.local_to_virtual(0.0, 0.0);
        let (px, py) = self.local_to_virtual(dx_dp / global_scale, dy_dp / global_scale);
        (px - ox, py - oy)
    }

    /// Project a plane rectangle into this viewport, clipped to the local
    /// extent and scaled to pixels. `None` when nothing is visible.
    pub fn project(&self, global_scale: f64, rect: Rect) -> Option<ScreenRect> {
        let corners = [
            self.virtual_to_local(rect.x, rect.y),
            self.virtual_to_local(rect.x + rect.width, rect.y),
            self.virtual_to_local(rect.x, rect.y + rect.height),
            self.virtual_to_local(rect.x + rect.width, rect.y + rect.height),
        ];
        let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
        let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
        let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
        let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);

        let (extent_w, extent_h) = self.local_extent();
        let left = min_x.max(0.0);
        let right = max_x.min(extent_w);
        let top = min_y.max(0.0);
        let bottom = max_y.min(extent_h);

        if !(right > left && bottom > top) {
            return None;
        }

        let k = self.px_per_vu(global_scale);
        Some(ScreenRect {
            x: left * k,
            y: top * k,
            width: (right - left) * k,
            height: (bottom - top) * k,
        })
    }
}

pub(crate) fn positive(field: &'static str, value: f64) -> Result<(), PlaneError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PlaneError::NonPositive { field, value })
    }
}

pub(crate) fn non_negative(field: &'static str, value: f64) -> Result<(), PlaneError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(PlaneError::Negative { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn viewport(orientation: Orientation) -> Viewport {
        Viewport {
            device_id: DeviceId::new("a"),
            offset_x: 300.0,
            offset_y: 50.0,
            width: 800.0,
            height: 600.0,
            orientation,
            local_screen_width: 320.0,
            local_screen_height: 240.0,
            density: 2.5,
        }
    }

    fn close(a: (f64, f64), b: (f64, f64)) -> bool {
        (a.0 - b.0).abs() < EPS && (a.1 - b.1).abs() < EPS
    }

    #[test]
    fn orientation_table_matches_formulas() {
        // rx = 100, ry = 30 relative to the offset
        let (x, y) = (400.0, 80.0);
        let cases = [
            (Orientation::Normal, (100.0, 30.0)),
            (Orientation::Rotated90, (570.0, 100.0)),
            (Orientation::Rotated180, (700.0, 570.0)),
            (Orientation::Rotated270, (30.0, 700.0)),
            (Orientation::FlippedX, (700.0, 30.0)),
            (Orientation::FlippedY, (100.0, 570.0)),
        ];
        for (orientation, expected) in cases {
            let local = viewport(orientation).virtual_to_local(x, y);
            assert!(
                close(local, expected),
                "{orientation:?}: got {local:?}, expected {expected:?}"
            );
        }
    }

    #[test]
    fn local_round_trip_every_orientation() {
        for orientation in Orientation::ALL {
            let vp = viewport(orientation);
            for &(x, y) in &[(301.0, 51.0), (700.0, 349.5), (1099.0, 649.0)] {
                let (lx, ly) = vp.virtual_to_local(x, y);
                assert!(close(vp.local_to_virtual(lx, ly), (x, y)), "{orientation:?}");
            }
        }
    }

    #[test]
    fn screen_round_trip_every_orientation() {
        let scale = 0.4;
        for orientation in Orientation::ALL {
            let vp = viewport(orientation);
            let (sx, sy) = vp.virtual_to_screen(scale, 512.25, 333.0);
            let back = vp.screen_to_virtual(scale, sx, sy);
            assert!(close(back, (512.25, 333.0)), "{orientation:?}: {back:?}");
        }
    }

    #[test]
    fn local_extent_swaps_for_quarter_turns() {
        assert_eq!(viewport(Orientation::Normal).local_extent(), (800.0, 600.0));
        assert_eq!(viewport(Orientation::Rotated90).local_extent(), (600.0, 800.0));
        assert_eq!(viewport(Orientation::Rotated270).local_extent(), (600.0, 800.0));
        assert_eq!(viewport(Orientation::FlippedY).local_extent(), (800.0, 600.0));
    }

    #[test]
    fn drag_delta_follows_orientation() {
        let scale = 0.5;
        // 10 dp to the right on screen is 20 VU in the local frame
        assert!(close(
            viewport(Orientation::Normal).local_delta_to_virtual(scale, 10.0, 0.0),
            (20.0, 0.0)
        ));
        // Rotated 90: local +x points towards plane -y
        assert!(close(
            viewport(Orientation::Rotated90).local_delta_to_virtual(scale, 10.0, 0.0),
            (0.0, -20.0)
        ));
        // Flipped X: local +x points towards plane -x
        assert!(close(
            viewport(Orientation::FlippedX).local_delta_to_virtual(scale, 10.0, 4.0),
            (-20.0, 8.0)
        ));
    }

    #[test]
    fn project_fully_inside_is_unclipped() {
        let vp = viewport(Orientation::Normal);
        let rect = vp.project(0.4, Rect::new(400.0, 100.0, 50.0, 20.0)).unwrap();
        let k = 2.5 * 0.4;
        assert!((rect.x - 100.0 * k).abs() < EPS);
        assert!((rect.y - 50.0 * k).abs() < EPS);
        assert!((rect.width - 50.0 * k).abs() < EPS);
        assert!((rect.height - 20.0 * k).abs() < EPS);
    }

    #[test]
    fn project_outside_is_not_visible() {
        let vp = viewport(Orientation::Normal);
        assert!(vp.project(0.4, Rect::new(0.0, 0.0, 100.0, 100.0)).is_none());
        assert!(vp.project(0.4, Rect::new(1200.0, 60.0, 10.0, 10.0)).is_none());
        // Touching the right edge exactly shows nothing
        assert!(vp.project(0.4, Rect::new(1100.0, 60.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn project_straddling_is_clamped() {
        let vp = viewport(Orientation::Normal);
        let rect = vp.project(1.0, Rect::new(250.0, 600.0, 100.0, 200.0)).unwrap();
        let k = 2.5;
        assert!((rect.x - 0.0).abs() < EPS);
        assert!((rect.width - 50.0 * k).abs() < EPS);
        assert!((rect.y - 550.0 * k).abs() < EPS);
        assert!((rect.height - 50.0 * k).abs() < EPS);
        assert!(rect.width >= 0.0 && rect.height >= 0.0);
    }

    #[test]
    fn project_rotated_uses_swapped_extent() {
        let vp = viewport(Orientation::Rotated90);
        // Plane strip along the viewport's left edge becomes the local top strip
        let rect = vp.project(1.0, Rect::new(300.0, 50.0, 10.0, 600.0)).unwrap();
        let k = 2.5;
        assert!((rect.width - 600.0 * k).abs() < EPS);
        assert!((rect.height - 10.0 * k).abs() < EPS);
        assert!((rect.y - 0.0).abs() < EPS);
    }

    #[test]
    fn patch_keeps_unspecified_fields() {
        let vp = viewport(Orientation::Normal);
        let patched = vp.patched(&ViewportPatch::orientation(Orientation::Rotated180));
        assert_eq!(patched.orientation, Orientation::Rotated180);
        assert_eq!(patched.offset_x, vp.offset_x);
        assert_eq!(patched.density, vp.density);
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let mut vp = viewport(Orientation::Normal);
        vp.width = 0.0;
        assert!(matches!(
            vp.validate(),
            Err(PlaneError::NonPositive { field: "width", .. })
        ));

        let mut vp = viewport(Orientation::Normal);
        vp.offset_y = -1.0;
        assert!(matches!(
            vp.validate(),
            Err(PlaneError::Negative { field: "offset_y", .. })
        ));

        let mut vp = viewport(Orientation::Normal);
        vp.density = f64::NAN;
        assert!(vp.validate().is_err());
    }
}
