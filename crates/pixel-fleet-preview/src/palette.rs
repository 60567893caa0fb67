//! Color id → RGB resolution.

use std::collections::HashMap;

use pixel_fleet_core::types::PaletteColor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pixel color as reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelColor {
    /// Palette index.
    Id(u32),
    Rgb([u8; 3]),
    /// Present but not interpretable.
    Unknown,
}

/// Anything that can turn a palette id into RGB.
pub trait Palette {
    fn rgb(&self, id: u32) -> Option<[u8; 3]>;

    fn resolve(&self, color: PixelColor) -> Option<[u8; 3]> {
        match color {
            PixelColor::Id(id) => self.rgb(id),
            PixelColor::Rgb(rgb) => Some(rgb),
            PixelColor::Unknown => None,
        }
    }
}

/// The palette announced by the coordinator or carried in a preview payload.
#[derive(Debug, Clone, Default)]
pub struct AvailableColors {
    colors: HashMap<u32, [u8; 3]>,
}

impl AvailableColors {
    pub fn new(colors: &[PaletteColor]) -> Self {
        Self {
            colors: colors.iter().map(|c| (c.id, [c.r, c.g, c.b])).collect(),
        }
    }

    /// Parse an `availableColors` array; entries without an id use their index.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let colors: HashMap<u32, [u8; 3]> = items
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let obj = c.as_object()?;
                let id = obj
                    .get("id")
                    .and_then(Value::as_u64)
                    .unwrap_or(i as u64) as u32;
                let channel = |k: &str| {
                    obj.get(k)
                        .and_then(Value::as_f64)
                        .map(|v| v.clamp(0.0, 255.0) as u8)
                        .unwrap_or(0)
                };
                Some((id, [channel("r"), channel("g"), channel("b")]))
            })
            .collect();
        (!colors.is_empty()).then_some(Self { colors })
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

impl Palette for AvailableColors {
    fn rgb(&self, id: u32) -> Option<[u8; 3]> {
        self.colors.get(&id).copied()
    }
}
