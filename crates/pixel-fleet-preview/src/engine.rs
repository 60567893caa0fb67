//! The preview engine: retained analysis plus everything needed to redraw it.

use std::time::{Duration, Instant};

use pixel_fleet_core::config::PreviewConfig;
use pixel_fleet_core::throttle::TtlCache;
use pixel_fleet_core::types::{PaletteColor, PixelCoord, ProjectMode};
use serde_json::Value;
use tracing::debug;

use crate::analysis::{Coord, PreviewAnalysis, infer_mode};
use crate::palette::AvailableColors;
use crate::render::{Layer, LayerToggles, Raster, render};
use crate::stats::PreviewStats;
use crate::view::{RefreshGate, RefreshTicket, ViewState};

/// How long a painted pixel stays highlighted.
pub const RECENT_REPAIR_TTL: Duration = Duration::from_secs(30);
const RECENT_REPAIR_CAPACITY: usize = 20_000;

pub struct PreviewEngine {
    analysis: Option<PreviewAnalysis>,
    /// Mode of the active project, when known; otherwise inferred per payload.
    mode_hint: Option<ProjectMode>,
    palette: AvailableColors,
    toggles: LayerToggles,
    recent_repairs: TtlCache<Coord>,
    view: ViewState,
    gate: RefreshGate,
}

impl PreviewEngine {
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            analysis: None,
            mode_hint: None,
            palette: AvailableColors::default(),
            toggles: LayerToggles::default(),
            recent_repairs: TtlCache::new(RECENT_REPAIR_CAPACITY),
            view: ViewState::new(config.min_zoom, config.fit_safety, config.stats_strip_px),
            gate: RefreshGate::new(Duration::from_millis(config.refresh_cooldown_ms)),
        }
    }

    pub fn set_mode_hint(&mut self, mode: Option<ProjectMode>) {
        self.mode_hint = mode;
    }

    pub fn set_palette(&mut self, colors: &[PaletteColor]) {
        if !colors.is_empty() {
            self.palette = AvailableColors::new(colors);
        }
    }

    /// Replace the retained analysis with one built from `payload`.
    ///
    /// Mode comes from the hint, else the payload shape, else Guard.
    pub fn ingest(&mut self, payload: &Value, now: Instant) -> PreviewStats {
        let mode = self
            .mode_hint
            .or_else(|| infer_mode(payload))
            .unwrap_or(ProjectMode::Guard);
        let mut analysis = PreviewAnalysis::from_payload(payload, mode);
        if let Some(palette) = analysis.palette.take() {
            self.palette = palette;
        }
        let stats = PreviewStats::from_analysis(&analysis);
        debug!(
            %mode,
            original = stats.original,
            correct = stats.correct,
            incorrect = stats.incorrect,
            missing = stats.missing,
            "Preview analysis rebuilt"
        );
        self.analysis = Some(analysis);
        self.gate.note_applied(now);
        stats
    }

    /// Ingest a fetched payload if its ticket is still current.
    pub fn ingest_fetched(
        &mut self,
        ticket: RefreshTicket,
        payload: &Value,
        now: Instant,
    ) -> Option<PreviewStats> {
        if !self.gate.accept(ticket, now) {
            debug!("Discarding stale preview fetch");
            return None;
        }
        Some(self.ingest(payload, now))
    }

    pub fn begin_refresh(&mut self, now: Instant) -> Option<RefreshTicket> {
        self.gate.try_begin(now)
    }

    pub fn refresh_remaining(&self, now: Instant) -> Duration {
        self.gate.remaining(now)
    }

    pub fn clear(&mut self) {
        self.analysis = None;
        self.recent_repairs.clear();
    }

    pub fn toggle_layer(&mut self, layer: Layer) -> bool {
        self.toggles.toggle(layer)
    }

    pub fn set_layer(&mut self, layer: Layer, on: bool) {
        self.toggles.set(layer, on);
    }

    pub fn layers(&self) -> LayerToggles {
        self.toggles
    }

    pub fn mark_repaired(&mut self, coords: &[PixelCoord], now: Instant) {
        for c in coords {
            self.recent_repairs.insert_at((c.x, c.y), RECENT_REPAIR_TTL, now);
        }
    }

    pub fn recent_repair_count(&mut self, now: Instant) -> usize {
        self.recent_repairs.live_keys(now).count()
    }

    pub fn stats(&self) -> Option<PreviewStats> {
        self.analysis.as_ref().map(PreviewStats::from_analysis)
    }

    pub fn analysis(&self) -> Option<&PreviewAnalysis> {
        self.analysis.as_ref()
    }

    /// Redraw from retained state.
    pub fn render(&mut self, now: Instant) -> Option<Raster> {
        let recent: Vec<Coord> = self.recent_repairs.live_keys(now).copied().collect();
        let analysis = self.analysis.as_ref()?;
        Some(render(analysis, &self.palette, &self.toggles, &recent))
    }

    /// Fit the view to the current raster inside a container.
    pub fn fit_view(&mut self, container_width: u32, container_height: u32) -> f64 {
        let (w, h) = self
            .analysis
            .as_ref()
            .map(|a| (a.area.width, a.area.height))
            .unwrap_or((0, 0));
        self.view.fit_to(w, h, container_width, container_height);
        self.view.fit()
    }

    pub fn set_zoom(&mut self, zoom: f64) -> f64 {
        self.view.set_zoom(zoom)
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }
}
