//! Zoom state and the preview refresh gate.

use std::time::{Duration, Instant};

/// Largest scale ≤ `safety` at which a `width`×`height` raster plus a
/// `strip`-pixel statistics panel fits inside the container.
pub fn fit_scale(
    width: u32,
    height: u32,
    container_width: u32,
    container_height: u32,
    safety: f64,
    strip: u32,
) -> f64 {
    let mut scale = safety;
    if width > 0 {
        scale = scale.min(f64::from(container_width) / f64::from(width));
    }
    if height > 0 {
        let usable = container_height.saturating_sub(strip).max(1);
        scale = scale.min(f64::from(usable) / f64::from(height));
    }
    scale.max(f64::EPSILON)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    zoom: f64,
    fit: f64,
    min_zoom: f64,
    safety: f64,
    strip: u32,
}

impl ViewState {
    pub fn new(min_zoom: f64, safety: f64, strip: u32) -> Self {
        Self {
            zoom: safety,
            fit: safety,
            min_zoom,
            safety,
            strip,
        }
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn fit(&self) -> f64 {
        self.fit
    }

    /// Lower zoom bound. Collapses onto the fit scale when the raster is so
    /// large that even `min_zoom` would overflow the container.
    pub fn lower_bound(&self) -> f64 {
        self.min_zoom.min(self.fit)
    }

    /// Recompute the fit scale for a new raster or container size and re-clamp.
    pub fn fit_to(&mut self, width: u32, height: u32, container_width: u32, container_height: u32) {
        self.fit = fit_scale(
            width,
            height,
            container_width,
            container_height,
            self.safety,
            self.strip,
        );
        self.zoom = self.clamp(self.zoom);
    }

    /// Reset zoom to the fit scale.
    pub fn reset(&mut self) {
        self.zoom = self.fit;
    }

    /// Set zoom, clamped to [lower bound, fit]. Returns the applied value.
    pub fn set_zoom(&mut self, zoom: f64) -> f64 {
        self.zoom = self.clamp(zoom);
        self.zoom
    }

    fn clamp(&self, zoom: f64) -> f64 {
        if zoom.is_nan() {
            return self.fit;
        }
        zoom.clamp(self.lower_bound(), self.fit)
    }
}

/// Issued by [`RefreshGate::try_begin`]; hand it back with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTicket {
    issued_at: Instant,
}

/// Spaces out preview fetches and discards results that arrive stale.
///
/// A fetched result is stale when newer preview data was applied after the
/// fetch was issued (a push from the agent, or a later fetch).
#[derive(Debug, Clone)]
pub struct RefreshGate {
    cooldown: Duration,
    last_begun: Option<Instant>,
    last_applied: Option<Instant>,
}

impl RefreshGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_begun: None,
            last_applied: None,
        }
    }

    /// Start a fetch unless one began within the cooldown.
    pub fn try_begin(&mut self, now: Instant) -> Option<RefreshTicket> {
        if let Some(last) = self.last_begun {
            if now.saturating_duration_since(last) < self.cooldown {
                return None;
            }
        }
        self.last_begun = Some(now);
        Some(RefreshTicket { issued_at: now })
    }

    /// Whether a fetched result may be applied. Accepting marks it applied.
    pub fn accept(&mut self, ticket: RefreshTicket, now: Instant) -> bool {
        if self.last_applied.is_some_and(|applied| applied > ticket.issued_at) {
            return false;
        }
        self.last_applied = Some(now);
        true
    }

    /// Record data applied outside a fetch (e.g. a pushed `preview_data`).
    pub fn note_applied(&mut self, now: Instant) {
        self.last_applied = Some(now);
    }

    /// Time left before another fetch may begin.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.last_begun
            .map(|last| self.cooldown.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or_default()
    }
}
