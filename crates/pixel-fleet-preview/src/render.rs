//! Layered RGBA rendering of a [`PreviewAnalysis`].
//!
//! Draw order: translucent background, original reference, then correct,
//! incorrect and missing on top, then the recent-repair highlight.

use serde::{Deserialize, Serialize};

use crate::analysis::{Coord, PreviewAnalysis};
use crate::palette::{Palette, PixelColor};

const BACKGROUND: [u8; 4] = [255, 255, 255, 40];
const ORIGINAL_ALPHA: u8 = 110;
const INCORRECT: [u8; 4] = [230, 40, 40, 255];
const MISSING: [u8; 4] = [255, 176, 0, 255];
const RECENT_REPAIR: [u8; 4] = [0, 200, 255, 255];
/// Used when a color id is not in the palette.
const FALLBACK_RGB: [u8; 3] = [128, 128, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Original,
    Correct,
    Incorrect,
    Missing,
    RecentRepairs,
}

impl std::str::FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(Self::Original),
            "correct" => Ok(Self::Correct),
            "incorrect" => Ok(Self::Incorrect),
            "missing" => Ok(Self::Missing),
            "recent" | "recent_repairs" => Ok(Self::RecentRepairs),
            other => Err(format!("unknown layer '{other}'")),
        }
    }
}

/// Which layers are drawn. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerToggles {
    pub original: bool,
    pub correct: bool,
    pub incorrect: bool,
    pub missing: bool,
    pub recent_repairs: bool,
}

impl Default for LayerToggles {
    fn default() -> Self {
        Self {
            original: true,
            correct: true,
            incorrect: true,
            missing: true,
            recent_repairs: true,
        }
    }
}

impl LayerToggles {
    pub fn is_on(&self, layer: Layer) -> bool {
        *self.slot(layer)
    }

    pub fn set(&mut self, layer: Layer, on: bool) {
        *self.slot_mut(layer) = on;
    }

    /// Flip `layer` and return its new state.
    pub fn toggle(&mut self, layer: Layer) -> bool {
        let slot = self.slot_mut(layer);
        *slot = !*slot;
        *slot
    }

    fn slot(&self, layer: Layer) -> &bool {
        match layer {
            Layer::Original => &self.original,
            Layer::Correct => &self.correct,
            Layer::Incorrect => &self.incorrect,
            Layer::Missing => &self.missing,
            Layer::RecentRepairs => &self.recent_repairs,
        }
    }

    fn slot_mut(&mut self, layer: Layer) -> &mut bool {
        match layer {
            Layer::Original => &mut self.original,
            Layer::Correct => &mut self.correct,
            Layer::Incorrect => &mut self.incorrect,
            Layer::Missing => &mut self.missing,
            Layer::RecentRepairs => &mut self.recent_repairs,
        }
    }
}

/// Straight-alpha RGBA8 image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Raster {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgba: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let i = self.index(x, y)?;
        Some([self.rgba[i], self.rgba[i + 1], self.rgba[i + 2], self.rgba[i + 3]])
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| (y as usize * self.width as usize + x as usize) * 4)
    }

    fn fill(&mut self, color: [u8; 4]) {
        for px in self.rgba.chunks_exact_mut(4) {
            blend(px, color);
        }
    }

    fn paint(&mut self, x: u32, y: u32, color: [u8; 4]) {
        if let Some(i) = self.index(x, y) {
            blend(&mut self.rgba[i..i + 4], color);
        }
    }

    /// Binary PPM (P6), composited over white.
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.width as usize * self.height as usize * 3);
        for px in self.rgba.chunks_exact(4) {
            let a = u32::from(px[3]);
            for c in &px[..3] {
                out.push(((u32::from(*c) * a + 255 * (255 - a)) / 255) as u8);
            }
        }
        out
    }
}

/// Source-over blend of `src` onto `dst` (both straight alpha).
fn blend(dst: &mut [u8], src: [u8; 4]) {
    let sa = u32::from(src[3]);
    if sa == 0 {
        return;
    }
    if sa == 255 {
        dst.copy_from_slice(&src);
        return;
    }
    let da = u32::from(dst[3]);
    let out_a = sa + da * (255 - sa) / 255;
    if out_a == 0 {
        return;
    }
    for c in 0..3 {
        let s = u32::from(src[c]) * sa;
        let d = u32::from(dst[c]) * da * (255 - sa) / 255;
        dst[c] = ((s + d) / out_a).min(255) as u8;
    }
    dst[3] = out_a as u8;
}

fn rgba(palette: &dyn Palette, color: PixelColor, alpha: u8) -> [u8; 4] {
    let [r, g, b] = palette.resolve(color).unwrap_or(FALLBACK_RGB);
    [r, g, b, alpha]
}

/// Draw `analysis` into a fresh raster covering its area.
pub fn render(
    analysis: &PreviewAnalysis,
    palette: &dyn Palette,
    toggles: &LayerToggles,
    recent_repairs: &[Coord],
) -> Raster {
    let area = analysis.area;
    let mut raster = Raster::new(area.width, area.height);
    raster.fill(BACKGROUND);

    let mut draw = |coord: Coord, color: [u8; 4]| {
        if area.contains(coord) {
            raster.paint((coord.0 - area.x) as u32, (coord.1 - area.y) as u32, color);
        }
    };

    if toggles.original {
        for (&c, &color) in &analysis.original {
            draw(c, rgba(palette, color, ORIGINAL_ALPHA));
        }
    }
    if toggles.correct {
        for (&c, &color) in &analysis.correct {
            draw(c, rgba(palette, color, 255));
        }
    }
    if toggles.incorrect {
        for &c in analysis.incorrect.keys() {
            draw(c, INCORRECT);
        }
    }
    if toggles.missing {
        for &c in analysis.missing.keys() {
            draw(c, MISSING);
        }
    }
    if toggles.recent_repairs {
        for &c in recent_repairs {
            draw(c, RECENT_REPAIR);
        }
    }
    raster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PreviewAnalysis;
    use crate::palette::AvailableColors;
    use pixel_fleet_core::types::{PaletteColor, ProjectMode};
    use serde_json::json;

    fn guard() -> PreviewAnalysis {
        PreviewAnalysis::from_payload(
            &json!({
                "area": {"x": 100, "y": 100, "width": 4, "height": 1},
                "originalPixels": [
                    {"x": 100, "y": 100, "colorId": 1},
                    {"x": 101, "y": 100, "colorId": 1},
                    {"x": 102, "y": 100, "colorId": 1}
                ],
                "correctPixels": [{"x": 100, "y": 100, "colorId": 1}],
                "incorrectPixels": [{"x": 101, "y": 100, "currentColor": 2, "expectedColor": 1}],
                "missingPixels": [{"x": 102, "y": 100, "expectedColor": 1}]
            }),
            ProjectMode::Guard,
        )
    }

    fn palette() -> AvailableColors {
        AvailableColors::new(&[PaletteColor { id: 1, r: 0, g: 0, b: 255 }])
    }

    #[test]
    fn test_layer_order() {
        let r = render(&guard(), &palette(), &LayerToggles::default(), &[]);
        assert_eq!((r.width, r.height), (4, 1));
        assert_eq!(r.pixel(0, 0), Some([0, 0, 255, 255]));
        assert_eq!(r.pixel(1, 0), Some(INCORRECT));
        assert_eq!(r.pixel(2, 0), Some(MISSING));
        // background only
        assert_eq!(r.pixel(3, 0), Some(BACKGROUND));
    }

    #[test]
    fn test_toggling_reveals_lower_layer() {
        let analysis = guard();
        let mut toggles = LayerToggles::default();
        assert!(!toggles.toggle(Layer::Incorrect));
        let r = render(&analysis, &palette(), &toggles, &[]);
        let px = r.pixel(1, 0).unwrap();
        // translucent original reference over background
        assert_ne!(px, INCORRECT);
        assert!(px[2] > px[0]);
        assert!(px[3] < 255);

        toggles.set(Layer::Original, false);
        let r = render(&analysis, &palette(), &toggles, &[]);
        assert_eq!(r.pixel(1, 0), Some(BACKGROUND));
    }

    #[test]
    fn test_recent_repair_highlight() {
        let r = render(&guard(), &palette(), &LayerToggles::default(), &[(103, 100), (500, 500)]);
        assert_eq!(r.pixel(3, 0), Some(RECENT_REPAIR));
    }

    #[test]
    fn test_unknown_color_falls_back() {
        let r = render(&guard(), &AvailableColors::default(), &LayerToggles::default(), &[]);
        assert_eq!(r.pixel(0, 0), Some([128, 128, 128, 255]));
    }

    #[test]
    fn test_ppm_header() {
        let r = Raster::new(2, 1);
        let ppm = r.to_ppm();
        assert!(ppm.starts_with(b"P6\n2 1\n255\n"));
        // transparent composites to white
        assert_eq!(&ppm[ppm.len() - 3..], &[255, 255, 255]);
    }

    #[test]
    fn test_layer_from_str() {
        assert_eq!("missing".parse::<Layer>().unwrap(), Layer::Missing);
        assert!("fog".parse::<Layer>().is_err());
    }
}
