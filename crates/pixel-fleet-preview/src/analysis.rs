//! Preview payload parsing.
//!
//! Two payload shapes arrive from the favorite agent:
//!
//! - **Image**: `width`, `height` and a `pixels` list, either row-major colors
//!   or `{x, y, color}` entries.
//! - **Guard**: an `area`/`protectionArea`, `originalPixels`, and the diff
//!   either as `correctPixels`/`incorrectPixels`/`missingPixels` lists or as a
//!   `changes`/`diffs` list of `{x, y, type}` entries. Any of these may also be
//!   nested under `analysis`.
//!
//! Missing lists are empty, malformed entries are skipped.

use std::collections::HashMap;

use pixel_fleet_core::types::ProjectMode;
use serde_json::{Map, Value};

use crate::palette::{AvailableColors, PixelColor};

/// Canvas coordinate.
pub type Coord = (i64, i64);

/// Largest raster side the renderer will allocate.
pub const MAX_SIDE: u32 = 8192;

const GUARD_MARKERS: &[&str] = &["area", "protectionArea", "changes", "diffs", "analysis"];

/// Infer the project mode from a payload's shape.
///
/// Guard markers win over raster dimensions when both are present.
pub fn infer_mode(payload: &Value) -> Option<ProjectMode> {
    let obj = payload.as_object()?;
    if GUARD_MARKERS.iter().any(|k| obj.contains_key(*k)) {
        return Some(ProjectMode::Guard);
    }
    if obj.contains_key("width") && obj.contains_key("height") {
        return Some(ProjectMode::Image);
    }
    None
}

/// Rectangle of canvas the preview covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Area {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Area {
    pub fn contains(&self, (x, y): Coord) -> bool {
        x >= self.x
            && y >= self.y
            && x < self.x.saturating_add(i64::from(self.width))
            && y < self.y.saturating_add(i64::from(self.height))
    }

    /// Accepts `{x1, y1, x2, y2}` (inclusive corners) or `{x, y, width, height}`.
    fn from_value(v: &Value) -> Option<Self> {
        let get = |k: &str| v.get(k).and_then(int_of);
        if let (Some(x1), Some(y1), Some(x2), Some(y2)) = (get("x1"), get("y1"), get("x2"), get("y2")) {
            let (x1, x2) = (x1.min(x2), x1.max(x2));
            let (y1, y2) = (y1.min(y2), y1.max(y2));
            return Some(Self::clamped(x1, y1, span(x1, x2), span(y1, y2)));
        }
        let (x, y) = (get("x")?, get("y")?);
        let (w, h) = (get("width")?, get("height")?);
        Some(Self::clamped(x, y, w, h))
    }

    fn clamped(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width: width.clamp(0, i64::from(MAX_SIDE)) as u32,
            height: height.clamp(0, i64::from(MAX_SIDE)) as u32,
        }
    }

    fn bounding<'a>(coords: impl Iterator<Item = &'a Coord>) -> Self {
        let mut bounds: Option<(i64, i64, i64, i64)> = None;
        for &(x, y) in coords {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
            });
        }
        match bounds {
            Some((x1, y1, x2, y2)) => Self::clamped(x1, y1, span(x1, x2), span(y1, y2)),
            None => Self::default(),
        }
    }
}

/// Inclusive length of `lo..=hi`; saturates for agent-supplied extremes.
fn span(lo: i64, hi: i64) -> i64 {
    hi.saturating_sub(lo).saturating_add(1)
}

/// A wrong pixel: what is there now and what should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub current: PixelColor,
    pub expected: PixelColor,
}

/// Reference vs. live pixel state, rebuilt wholesale from each payload.
///
/// `correct`, `incorrect` and `missing` are disjoint: a coordinate listed in
/// several categories is kept only in the first of incorrect, missing, correct.
#[derive(Debug, Clone)]
pub struct PreviewAnalysis {
    pub mode: ProjectMode,
    pub area: Area,
    pub original: HashMap<Coord, PixelColor>,
    pub correct: HashMap<Coord, PixelColor>,
    pub incorrect: HashMap<Coord, Mismatch>,
    pub missing: HashMap<Coord, PixelColor>,
    /// Reference size as declared by the agent, if it differs from `original.len()`.
    pub declared_original: Option<u64>,
    /// Palette carried in the payload itself.
    pub palette: Option<AvailableColors>,
}

impl PreviewAnalysis {
    pub fn empty(mode: ProjectMode) -> Self {
        Self {
            mode,
            area: Area::default(),
            original: HashMap::new(),
            correct: HashMap::new(),
            incorrect: HashMap::new(),
            missing: HashMap::new(),
            declared_original: None,
            palette: None,
        }
    }

    /// Parse `payload` as `mode`.
    pub fn from_payload(payload: &Value, mode: ProjectMode) -> Self {
        let empty = Map::new();
        let obj = payload.as_object().unwrap_or(&empty);
        let mut analysis = match mode {
            ProjectMode::Image => Self::parse_image(obj),
            ProjectMode::Guard => Self::parse_guard(obj),
        };
        analysis.palette = obj.get("availableColors").and_then(AvailableColors::from_value);
        analysis
    }

    /// Size of the reference set used for accuracy.
    pub fn original_count(&self) -> u64 {
        self.declared_original
            .unwrap_or(0)
            .max(self.original.len() as u64)
    }

    fn parse_image(obj: &Map<String, Value>) -> Self {
        let mut analysis = Self::empty(ProjectMode::Image);
        let width = obj.get("width").and_then(int_of).unwrap_or(0);
        let height = obj.get("height").and_then(int_of).unwrap_or(0);
        analysis.area = Area::clamped(0, 0, width, height);
        let w = i64::from(analysis.area.width);

        let pixels = obj
            .get("pixels")
            .or_else(|| obj.get("colors"))
            .and_then(Value::as_array);
        for (i, entry) in pixels.into_iter().flatten().enumerate() {
            if entry.is_null() {
                continue;
            }
            let (coord, color) = match coord_of(entry) {
                Some(c) => (c, color_of(entry, &["color", "colorId"])),
                None if w > 0 => ((i as i64 % w, i as i64 / w), color_value(entry)),
                None => continue,
            };
            if analysis.area.contains(coord) {
                analysis.original.insert(coord, color);
            }
        }
        analysis
    }

    fn parse_guard(obj: &Map<String, Value>) -> Self {
        let mut analysis = Self::empty(ProjectMode::Guard);
        let nested = obj.get("analysis").and_then(Value::as_object);
        let lookup = |key: &str| obj.get(key).or_else(|| nested.and_then(|n| n.get(key)));

        for entry in list(lookup("originalPixels")) {
            if let Some(c) = coord_of(entry) {
                analysis.original.insert(c, color_of(entry, &["color", "colorId"]));
            }
        }
        for entry in list(lookup("correctPixels")) {
            if let Some(c) = coord_of(entry) {
                analysis.correct.insert(c, color_of(entry, &["color", "colorId", "expectedColor"]));
            }
        }
        for entry in list(lookup("incorrectPixels")) {
            if let Some(c) = coord_of(entry) {
                analysis.incorrect.insert(c, mismatch_of(entry));
            }
        }
        for entry in list(lookup("missingPixels")) {
            if let Some(c) = coord_of(entry) {
                analysis.missing.insert(c, color_of(entry, &["expectedColor", "color", "colorId"]));
            }
        }

        let changes = lookup("changes").or_else(|| lookup("diffs"));
        for entry in list(changes) {
            let Some(c) = coord_of(entry) else { continue };
            match entry.get("type").and_then(Value::as_str) {
                Some("incorrect") => {
                    analysis.incorrect.insert(c, mismatch_of(entry));
                }
                Some("missing" | "absent") => {
                    analysis
                        .missing
                        .insert(c, color_of(entry, &["expectedColor", "color", "colorId"]));
                }
                Some("correct") => {
                    analysis
                        .correct
                        .insert(c, color_of(entry, &["color", "expectedColor"]));
                }
                _ => {}
            }
        }

        analysis.declared_original = ["originalCount", "totalPixels", "original_count"]
            .iter()
            .find_map(|k| lookup(k).and_then(int_of))
            .map(|n| n.max(0) as u64);

        analysis.enforce_disjoint();

        analysis.area = lookup("area")
            .or_else(|| lookup("protectionArea"))
            .and_then(Area::from_value)
            .unwrap_or_else(|| {
                Area::bounding(
                    analysis
                        .original
                        .keys()
                        .chain(analysis.correct.keys())
                        .chain(analysis.incorrect.keys())
                        .chain(analysis.missing.keys()),
                )
            });
        analysis
    }

    fn enforce_disjoint(&mut self) {
        let incorrect = &self.incorrect;
        self.missing.retain(|c, _| !incorrect.contains_key(c));
        let missing = &self.missing;
        self.correct
            .retain(|c, _| !incorrect.contains_key(c) && !missing.contains_key(c));
    }
}

fn list(v: Option<&Value>) -> impl Iterator<Item = &Value> {
    v.and_then(Value::as_array).into_iter().flatten()
}

fn int_of(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.floor() as i64),
        _ => None,
    }
}

fn coord_of(v: &Value) -> Option<Coord> {
    Some((v.get("x").and_then(int_of)?, v.get("y").and_then(int_of)?))
}

/// A bare color value: palette id, `{r, g, b}`, or `[r, g, b]`.
fn color_value(v: &Value) -> PixelColor {
    if let Some(id) = v.as_u64() {
        return PixelColor::Id(id as u32);
    }
    if let Some(rgb) = rgb_of(v) {
        return PixelColor::Rgb(rgb);
    }
    PixelColor::Unknown
}

fn rgb_of(v: &Value) -> Option<[u8; 3]> {
    let channel = |c: &Value| c.as_f64().map(|f| f.clamp(0.0, 255.0) as u8);
    if let Some(arr) = v.as_array() {
        if arr.len() >= 3 {
            return Some([channel(&arr[0])?, channel(&arr[1])?, channel(&arr[2])?]);
        }
        return None;
    }
    Some([
        channel(v.get("r")?)?,
        channel(v.get("g")?)?,
        channel(v.get("b")?)?,
    ])
}

/// Color of a pixel entry: the first present key, else inline `r`/`g`/`b`.
fn color_of(entry: &Value, keys: &[&str]) -> PixelColor {
    keys.iter()
        .find_map(|k| entry.get(*k).filter(|v| !v.is_null()))
        .map(color_value)
        .or_else(|| rgb_of(entry).map(PixelColor::Rgb))
        .unwrap_or(PixelColor::Unknown)
}

fn mismatch_of(entry: &Value) -> Mismatch {
    Mismatch {
        current: color_of(entry, &["currentColor", "current"]),
        expected: color_of(entry, &["expectedColor", "expected", "color"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_mode() {
        assert_eq!(infer_mode(&json!({"area": {}})), Some(ProjectMode::Guard));
        assert_eq!(infer_mode(&json!({"changes": []})), Some(ProjectMode::Guard));
        assert_eq!(infer_mode(&json!({"width": 2, "height": 2})), Some(ProjectMode::Image));
        // both present: Guard wins
        assert_eq!(
            infer_mode(&json!({"width": 2, "height": 2, "analysis": {}})),
            Some(ProjectMode::Guard)
        );
        assert_eq!(infer_mode(&json!({"width": 2})), None);
        assert_eq!(infer_mode(&json!("nope")), None);
    }

    #[test]
    fn test_image_row_major() {
        let a = PreviewAnalysis::from_payload(
            &json!({"width": 2, "height": 2, "pixels": [1, null, {"r": 9, "g": 8, "b": 7}, 4]}),
            ProjectMode::Image,
        );
        assert_eq!(a.area, Area { x: 0, y: 0, width: 2, height: 2 });
        assert_eq!(a.original.len(), 3);
        assert_eq!(a.original[&(0, 0)], PixelColor::Id(1));
        assert_eq!(a.original[&(0, 1)], PixelColor::Rgb([9, 8, 7]));
        assert_eq!(a.original[&(1, 1)], PixelColor::Id(4));
    }

    #[test]
    fn test_guard_lists_and_area() {
        let a = PreviewAnalysis::from_payload(
            &json!({
                "area": {"x1": 10, "y1": 20, "x2": 12, "y2": 21},
                "originalPixels": [{"x": 10, "y": 20, "colorId": 3}, {"x": 11, "y": 20, "colorId": 3}],
                "correctPixels": [{"x": 10, "y": 20}],
                "incorrectPixels": [{"x": 11, "y": 20, "currentColor": 5, "expectedColor": 3}],
                "missingPixels": [{"x": 12, "y": 21, "expectedColor": 3}]
            }),
            ProjectMode::Guard,
        );
        assert_eq!(a.area, Area { x: 10, y: 20, width: 3, height: 2 });
        assert_eq!(a.original.len(), 2);
        assert_eq!(a.correct.len(), 1);
        assert_eq!(
            a.incorrect[&(11, 20)],
            Mismatch { current: PixelColor::Id(5), expected: PixelColor::Id(3) }
        );
        assert_eq!(a.missing[&(12, 21)], PixelColor::Id(3));
    }

    #[test]
    fn test_guard_changes_list_nested_under_analysis() {
        let a = PreviewAnalysis::from_payload(
            &json!({
                "analysis": {
                    "changes": [
                        {"x": 1, "y": 1, "type": "absent", "expectedColor": 2},
                        {"x": 2, "y": 1, "type": "incorrect", "currentColor": 7, "expectedColor": 2},
                        {"x": 3, "y": 1, "type": "weird"},
                        {"y": 1, "type": "missing"}
                    ],
                    "totalPixels": 50
                }
            }),
            ProjectMode::Guard,
        );
        assert_eq!(a.missing.len(), 1);
        assert_eq!(a.incorrect.len(), 1);
        assert_eq!(a.original_count(), 50);
        assert_eq!(a.area, Area { x: 1, y: 1, width: 2, height: 1 });
    }

    #[test]
    fn test_categories_are_disjoint() {
        let a = PreviewAnalysis::from_payload(
            &json!({
                "correctPixels": [{"x": 0, "y": 0}, {"x": 1, "y": 0}],
                "missingPixels": [{"x": 0, "y": 0}, {"x": 2, "y": 0}],
                "incorrectPixels": [{"x": 2, "y": 0}]
            }),
            ProjectMode::Guard,
        );
        assert!(a.incorrect.contains_key(&(2, 0)));
        assert!(!a.missing.contains_key(&(2, 0)));
        assert!(a.missing.contains_key(&(0, 0)));
        assert!(!a.correct.contains_key(&(0, 0)));
        assert!(a.correct.contains_key(&(1, 0)));
    }

    #[test]
    fn test_malformed_payload_defaults() {
        let a = PreviewAnalysis::from_payload(&json!({"correctPixels": "lots"}), ProjectMode::Guard);
        assert!(a.correct.is_empty());
        assert_eq!(a.area, Area::default());
        let b = PreviewAnalysis::from_payload(&json!(42), ProjectMode::Image);
        assert!(b.original.is_empty());
    }

    #[test]
    fn test_huge_area_is_clamped() {
        let a = PreviewAnalysis::from_payload(
            &json!({"area": {"x": 0, "y": 0, "width": 1_000_000, "height": 3}}),
            ProjectMode::Guard,
        );
        assert_eq!(a.area.width, MAX_SIDE);
    }

    #[test]
    fn test_extreme_coordinates_saturate() {
        let a = PreviewAnalysis::from_payload(
            &json!({"area": {"x1": -1e30, "y1": 0, "x2": 1e30, "y2": 1e30}}),
            ProjectMode::Guard,
        );
        assert_eq!((a.area.width, a.area.height), (MAX_SIDE, MAX_SIDE));
        assert!(a.area.contains((i64::MIN, 0)));
        assert!(!a.area.contains((i64::MAX, 0)));

        // no area: bounds come from the pixels themselves
        let b = PreviewAnalysis::from_payload(
            &json!({"missingPixels": [{"x": -1e30, "y": 0}, {"x": 1e30, "y": 1e30}]}),
            ProjectMode::Guard,
        );
        assert_eq!(b.missing.len(), 2);
        assert_eq!(b.area.width, MAX_SIDE);

        let edge = Area { x: i64::MAX - 1, y: 0, width: 10, height: 1 };
        assert!(edge.contains((i64::MAX - 1, 0)));
        assert!(!edge.contains((i64::MAX, 0)));
    }
}
