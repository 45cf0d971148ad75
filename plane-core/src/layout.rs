//! Master-side placement of joining devices.

use plane_types::{DeviceId, Orientation, ScreenInfo};

use crate::plane::{PlaneEngine, PlaneError};
use crate::viewport::{positive, Viewport};

/// Gaps narrower than this are treated as rounding leftovers, not slots.
const MIN_GAP_VU: f64 = 1e-6;

/// Compute a viewport for a joining device.
///
/// The viewport is `screen / global_scale` VU large (height capped at the
/// plane height; axes swapped for quarter turns) and goes into the first
/// horizontal gap, scanning left to right, that it fits. If no gap fits
/// whole, the widest gap is used and the width is truncated to it.
///
/// A device that already has a viewport keeps its slot: its own viewport is
/// ignored when looking for gaps.
///
/// The result is not inserted; call [`PlaneEngine::define_viewport`].
pub fn place_viewport(
    engine: &PlaneEngine,
    device_id: &DeviceId,
    screen: ScreenInfo,
    orientation: Orientation,
) -> Result<Viewport, PlaneError> {
    let plane = engine.plane().ok_or(PlaneError::PlaneNotInitialized)?;
    positive("width_dp", screen.width_dp)?;
    positive("height_dp", screen.height_dp)?;
    positive("density", screen.density)?;

    let scale = plane.global_scale_dp_per_vu;
    let (mut width, mut height) = (screen.width_dp / scale, screen.height_dp / scale);
    if orientation.swaps_axes() {
        std::mem::swap(&mut width, &mut height);
    }
    let height = height.min(plane.height_vu);

    let mut occupied: Vec<(f64, f64)> = engine
        .viewports()
        .filter(|v| &v.device_id != device_id)
        .map(|v| (v.offset_x, v.offset_x + v.width))
        .collect();
    occupied.sort_by(|a, b| a.0.total_cmp(&b.0));

    let gaps = free_gaps(&occupied, plane.width_vu);
    let (offset_x, width) = match gaps.iter().find(|(start, end)| end - start >= width) {
        Some(&(start, _)) => (start, width),
        None => {
            let widest = gaps
                .iter()
                .copied()
                .max_by(|a, b| (a.1 - a.0).total_cmp(&(b.1 - b.0)));
            match widest {
                Some((start, end)) => (start, end - start),
                None => {
                    return Err(PlaneError::NoFreeSlot {
                        device_id: device_id.clone(),
                    })
                }
            }
        }
    };

    Ok(Viewport {
        device_id: device_id.clone(),
        offset_x,
        offset_y: 0.0,
        width,
        height,
        orientation,
        local_screen_width: screen.width_dp,
        local_screen_height: screen.height_dp,
        density: screen.density,
    })
}

/// Free horizontal intervals of `[0, plane_width]` given sorted occupied spans.
fn free_gaps(occupied: &[(f64, f64)], plane_width: f64) -> Vec<(f64, f64)> {
    let mut gaps = Vec::new();
    let mut cursor = 0.0_f64;
    for &(start, end) in occupied {
        let gap_end = start.min(plane_width);
        if gap_end - cursor > MIN_GAP_VU {
            gaps.push((cursor, gap_end));
        }
        cursor = cursor.max(end);
    }
    if plane_width - cursor > MIN_GAP_VU {
        gaps.push((cursor, plane_width));
    }
    gaps
}
