//! Project command - offline coordinate check.
//!
//! Places this device's viewport on an otherwise empty plane at
//! `offset_x` and prints where a plane rectangle lands on its screen.

use anyhow::{Context, Result};
use plane_core::{place_viewport, PlaneEngine, Rect, ScreenRect, Viewport, ViewportPatch};
use plane_link::Config;
use plane_types::{DeviceId, Orientation};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Projection {
    viewport: Viewport,
    rect: Rect,
    /// `None` when the rectangle is off screen
    screen_rect: Option<ScreenRect>,
}

/// Run the project command.
pub fn run(config: &Config, offset_x: f64, orientation: &str, rect: [f64; 4]) -> Result<()> {
    let orientation: Orientation = orientation.parse().map_err(anyhow::Error::msg)?;
    let device_id = DeviceId::new(config.node.device_id.as_deref().unwrap_or("local"));

    let mut engine = PlaneEngine::new();
    engine.init_plane(
        config.plane.width_vu,
        config.plane.height_vu,
        config.plane.global_scale_dp_per_vu,
    )?;
    let placed = place_viewport(&engine, &device_id, config.screen_info(), orientation)?;
    engine.define_viewport(placed)?;
    let viewport = engine
        .update_viewport(&device_id, &ViewportPatch::offset(offset_x, 0.0))
        .context("Viewport does not fit on the plane at that offset")?;

    let [x, y, width, height] = rect;
    let rect = Rect::new(x, y, width, height);
    let screen_rect = engine.project_rect(&device_id, rect)?;

    let projection = Projection {
        viewport,
        rect,
        screen_rect,
    };
    println!("{}", serde_json::to_string_pretty(&projection)?);
    Ok(())
}
