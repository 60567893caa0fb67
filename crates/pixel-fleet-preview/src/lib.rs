//! Preview/diff engine.
//!
//! Reconciles reference pixels against live canvas state reported by the
//! favorite agent, and turns the result into a layered raster plus stats.

pub mod analysis;
pub mod engine;
pub mod palette;
pub mod render;
pub mod stats;
pub mod view;

pub use analysis::{Area, Coord, Mismatch, PreviewAnalysis, infer_mode};
pub use engine::PreviewEngine;
pub use palette::{AvailableColors, Palette, PixelColor};
pub use render::{Layer, LayerToggles, Raster};
pub use stats::PreviewStats;
pub use view::{RefreshGate, RefreshTicket, ViewState};
