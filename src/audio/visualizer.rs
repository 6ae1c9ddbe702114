//! # Visualizer
//!
//! Turns an analysis tap into bar graphs, once per display refresh, while the
//! session is live. Each audio path (microphone and tutor) has its own loop
//! and its own drawing surface.
//!
//! ## Layout:
//! - one bar per frequency bin, drawn left to right
//! - bar width = `(surface_width / bin_count) * 2.5` (bars overlap, as on the page)
//! - bar height = `value / 255 * surface_height`
//!
//! ## Stopping:
//! The loop clears its surface and returns as soon as the active flag turns
//! false, the flag's sender is dropped, or the tap reports it is closed.

use crate::audio::analysis::AnalysisTap;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// One bar of the graph, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bar {
    pub x: f32,
    pub width: f32,
    pub height: f32,
}

/// A drawing surface for one audio path.
pub trait RenderSurface: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn draw_bars(&mut self, bars: &[Bar]);

    fn clear(&mut self);
}

/// Lay out one bar per bin across a `width` x `height` surface.
pub fn compute_bars(data: &[u8], width: u32, height: u32) -> Vec<Bar> {
    if data.is_empty() {
        return Vec::new();
    }
    let bar_width = (width as f32 / data.len() as f32) * 2.5;
    let mut x = 0.0;
    data.iter()
        .map(|&value| {
            let bar = Bar {
                x,
                width: bar_width,
                height: value as f32 / 255.0 * height as f32,
            };
            x += bar_width + 1.0;
            bar
        })
        .collect()
}

/// Draw from `tap` at `refresh_hz` until `active` turns false or the tap closes.
pub async fn run_visualizer(
    tap: AnalysisTap,
    mut surface: Box<dyn RenderSurface>,
    refresh_hz: u32,
    mut active: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(1.0 / refresh_hz.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let source = tap.source();

    loop {
        if !*active.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let Some(data) = tap.frequency_data() else { break };
                let bars = compute_bars(&data, surface.width(), surface.height());
                surface.draw_bars(&bars);
            }
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    surface.clear();
    debug!(source = source.as_str(), "Visualizer stopped");
}
