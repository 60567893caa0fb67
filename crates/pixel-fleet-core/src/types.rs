use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{FleetError, Result};

/// Self-reported agent status.
///
/// Replaced wholesale on every `telemetry_update`; nothing here is merged
/// field-by-field with a previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default, deserialize_with = "lenient::count")]
    pub remaining_charges: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub max_charges: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub repaired_pixels: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub correct_pixels: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub incorrect_pixels: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub missing_pixels: u64,
    /// Raw preview payload forwarded by the favorite agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_data: Option<Value>,
    /// Freshly computed Guard analysis, if the agent ran one since its last report.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::optional_analysis"
    )]
    pub analysis: Option<AnalysisSummary>,
    /// Anything else the agent reports, kept for display.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Camel-case keys agents are known to send, mapped to their canonical name.
const TELEMETRY_ALIASES: &[(&str, &str)] = &[
    ("previewData", "preview_data"),
    ("remainingCharges", "remaining_charges"),
    ("maxCharges", "max_charges"),
    ("repairedPixels", "repaired_pixels"),
    ("correctPixels", "correct_pixels"),
    ("incorrectPixels", "incorrect_pixels"),
    ("missingPixels", "missing_pixels"),
    ("analysisSummary", "analysis"),
];

impl Telemetry {
    /// Build telemetry from an arbitrary JSON value.
    ///
    /// Alias keys are normalized first (a canonical key wins over its alias).
    /// A value that still fails to parse yields default telemetry.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::default();
        };
        for (alias, canonical) in TELEMETRY_ALIASES {
            if let Some(v) = map.remove(*alias) {
                map.entry(canonical.to_string()).or_insert(v);
            }
        }
        match serde_json::from_value(Value::Object(map)) {
            Ok(t) => t,
            Err(e) => {
                warn!(%e, "Malformed telemetry, using defaults");
                Self::default()
            }
        }
    }
}

/// Guard analysis counts computed by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(default, alias = "correctPixels", deserialize_with = "lenient::count")]
    pub correct: u64,
    #[serde(default, alias = "incorrectPixels", deserialize_with = "lenient::count")]
    pub incorrect: u64,
    #[serde(default, alias = "missingPixels", deserialize_with = "lenient::count")]
    pub missing: u64,
}

/// A remote agent known to the console.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    pub id: String,
    pub connected: bool,
    /// Activity reported via `status_update` (idle, working, error, ...).
    pub status: String,
    pub telemetry: Telemetry,
    pub favorite: bool,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: true,
            status: "idle".into(),
            telemetry: Telemetry::default(),
            favorite: false,
            last_seen: Utc::now(),
        }
    }
}

/// Agent entry as listed by the coordinator in `initial_state`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    #[serde(default = "default_agent_status")]
    pub status: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub telemetry: Value,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default, deserialize_with = "lenient::timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_agent_status() -> String {
    "idle".into()
}

impl AgentSnapshot {
    pub fn into_agent(self) -> Agent {
        Agent {
            id: self.id,
            connected: true,
            status: self.status,
            telemetry: Telemetry::from_value(self.telemetry),
            favorite: self.is_favorite,
            last_seen: self.last_seen.unwrap_or_else(Utc::now),
        }
    }
}

/// Project mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectMode {
    Image,
    Guard,
}

impl std::fmt::Display for ProjectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => f.write_str("Image"),
            Self::Guard => f.write_str("Guard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub mode: ProjectMode,
    /// Opaque mode-specific payload, passed through to agents untouched.
    #[serde(default)]
    pub config: Value,
}

/// How the coordinator spreads work across the session's agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Balanced,
    Drain,
    Priority,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Created,
    Running,
    Paused,
    Stopped,
}

/// A requested change of session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Stop,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for SessionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

impl SessionStatus {
    /// Apply `action` to this status.
    ///
    /// Valid transitions: created→running (start), running→paused (pause),
    /// paused→running (resume), running|paused→stopped (stop). Stopped is terminal.
    pub fn transition(self, action: SessionAction) -> Result<SessionStatus> {
        use SessionAction as A;
        use SessionStatus as S;
        match (self, action) {
            (S::Created, A::Start) => Ok(S::Running),
            (S::Running, A::Pause) => Ok(S::Paused),
            (S::Paused, A::Resume) => Ok(S::Running),
            (S::Running | S::Paused, A::Stop) => Ok(S::Stopped),
            (from, action) => Err(FleetError::Transition {
                from: from.to_string(),
                action: action.to_string(),
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }
}

/// Session record as listed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default, rename = "slave_ids")]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub status: SessionStatus,
}

/// A single canvas coordinate on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: i64,
    pub y: i64,
}

/// Palette entry announced by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteColor {
    pub id: u32,
    #[serde(default)]
    pub r: u8,
    #[serde(default)]
    pub g: u8,
    #[serde(default)]
    pub b: u8,
}

/// Forgiving deserializers for agent-reported fields.
///
/// Missing or oddly typed values default instead of failing the whole message.
pub mod lenient {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Non-negative count from a number, numeric string, or null.
    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(count_of(&v))
    }

    pub fn count_of(v: &Value) -> u64 {
        match v {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f.floor() as u64))
                .unwrap_or(0),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| *f > 0.0)
                .map(|f| f.floor() as u64)
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Telemetry via [`super::Telemetry::from_value`].
    pub fn telemetry<'de, D: Deserializer<'de>>(d: D) -> Result<super::Telemetry, D::Error> {
        Ok(super::Telemetry::from_value(Value::deserialize(d)?))
    }

    pub fn optional_telemetry<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<super::Telemetry>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok((!v.is_null()).then(|| super::Telemetry::from_value(v)))
    }

    pub fn optional_project<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<super::Project>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(serde_json::from_value(v).ok())
    }

    /// Anything that is not an analysis object reads as no analysis.
    pub fn optional_analysis<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<super::AnalysisSummary>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(v.is_object().then(|| serde_json::from_value(v).ok()).flatten())
    }

    /// A list whose malformed entries are dropped instead of failing the list.
    pub fn vec_skip_invalid<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: serde::de::DeserializeOwned,
    {
        let v = Value::deserialize(d)?;
        let Value::Array(items) = v else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    /// RFC 3339 timestamp, or a naive ISO timestamp taken as UTC.
    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let v = Option::<String>::deserialize(d).unwrap_or(None);
        Ok(v.and_then(|s| parse_timestamp(&s)))
    }

    pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|n| n.and_utc())
    }
}
