//! Coordinator wire protocol.
//!
//! The coordinator pushes JSON text frames over the `/ws/ui` channel, tagged by
//! a `type` field. Every kind the console understands is a variant of
//! [`InboundMessage`]; anything else lands in [`InboundMessage::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;
use crate::error::{FleetError, Result};
use crate::types::{
    AgentSnapshot, PaletteColor, PixelCoord, Project, SessionRecord, Telemetry, lenient,
};

/// An inbound frame from the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Authoritative snapshot, sent once after every (re)connect.
    InitialState(InitialState),

    SlaveConnected {
        #[serde(rename = "slave_id")]
        agent_id: String,
    },
    SlaveReconnected {
        #[serde(rename = "slave_id")]
        agent_id: String,
    },
    SlaveDisconnected {
        #[serde(rename = "slave_id")]
        agent_id: String,
    },

    UiSelectedSlaves {
        #[serde(default, rename = "slave_ids")]
        agent_ids: Vec<String>,
    },

    TelemetryUpdate {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default, deserialize_with = "lenient::telemetry")]
        telemetry: Telemetry,
    },
    StatusUpdate {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default = "idle")]
        status: String,
    },
    /// Keepalive-driven status refresh; may carry telemetry.
    SlaveStatusUpdate {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default = "idle")]
        status: String,
        #[serde(default, deserialize_with = "lenient::optional_telemetry")]
        telemetry: Option<Telemetry>,
    },
    #[serde(alias = "favorite_set")]
    SlaveFavorite {
        #[serde(rename = "slave_id")]
        agent_id: String,
    },

    PreviewData {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default)]
        data: Value,
    },

    RepairSuggestion {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default)]
        pixels: Vec<Value>,
        #[serde(default, rename = "totalDiffs", deserialize_with = "lenient::count")]
        total_diffs: u64,
    },
    RepairAck {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default, deserialize_with = "lenient::count")]
        total_repairs: u64,
        #[serde(default = "unknown_source")]
        source: String,
    },
    RepairProgress {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default, deserialize_with = "lenient::count")]
        completed: u64,
        #[serde(default, deserialize_with = "lenient::count")]
        total: u64,
        #[serde(default = "unknown_source")]
        source: String,
    },
    RepairComplete {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default, deserialize_with = "lenient::count")]
        completed: u64,
        #[serde(default = "unknown_source")]
        source: String,
    },
    RepairError {
        #[serde(rename = "slave_id")]
        agent_id: String,
        #[serde(default = "unknown_error")]
        error: String,
        #[serde(default = "unknown_source")]
        source: String,
    },

    PaintProgress(PaintProgress),
    PaintResult(PaintResult),

    GuardConfig {
        #[serde(default)]
        config: Value,
        #[serde(default)]
        changed: Value,
    },
    GuardCleared {
        #[serde(default, rename = "cleared_slaves")]
        cleared_agents: Vec<String>,
        #[serde(default, rename = "guardDataCleared")]
        guard_data_cleared: bool,
    },
    GuardUploadSent(GuardUploadSent),

    ProjectCreated {
        #[serde(default)]
        project_id: String,
        #[serde(default, deserialize_with = "lenient::optional_project")]
        project: Option<Project>,
    },
    ProjectDeleted {
        #[serde(default)]
        project_id: String,
    },
    ProjectsCleared {
        #[serde(default, deserialize_with = "lenient::count")]
        projects_deleted: u64,
        #[serde(default, deserialize_with = "lenient::count")]
        sessions_deleted: u64,
    },

    Log {
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        message: String,
        #[serde(default, rename = "slave_id")]
        agent_id: Option<String>,
    },

    /// A compressed wrapper that could not be unpacked.
    #[serde(rename = "__compressed__")]
    Compressed(PendingFrame),

    #[serde(other)]
    Unknown,
}

fn idle() -> String {
    "idle".into()
}

fn unknown_source() -> String {
    "unknown".into()
}

fn unknown_error() -> String {
    "Unknown error".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitialState {
    #[serde(default, rename = "slaves", deserialize_with = "lenient::vec_skip_invalid")]
    pub agents: Vec<AgentSnapshot>,
    #[serde(default, deserialize_with = "lenient::vec_skip_invalid")]
    pub projects: Vec<Project>,
    #[serde(default, deserialize_with = "lenient::vec_skip_invalid")]
    pub sessions: Vec<SessionRecord>,
    #[serde(default, rename = "selected_slaves")]
    pub selected_agents: Vec<String>,
    #[serde(default, deserialize_with = "lenient::vec_skip_invalid")]
    pub available_colors: Vec<PaletteColor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaintProgress {
    #[serde(rename = "slave_id")]
    pub agent_id: String,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default, deserialize_with = "lenient::count")]
    pub completed: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub total: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaintResult {
    #[serde(rename = "slave_id")]
    pub agent_id: String,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, deserialize_with = "lenient::vec_skip_invalid")]
    pub coords: Vec<PixelCoord>,
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(default, rename = "tileX", deserialize_with = "lenient::count")]
    pub tile_x: u64,
    #[serde(default, rename = "tileY", deserialize_with = "lenient::count")]
    pub tile_y: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardUploadSent {
    #[serde(default, rename = "slave_id")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default, deserialize_with = "lenient::count")]
    pub pixels: u64,
    #[serde(default, rename = "originalLength", deserialize_with = "lenient::count")]
    pub original_length: u64,
    #[serde(default, rename = "compressedLength", deserialize_with = "lenient::count")]
    pub compressed_length: u64,
    #[serde(default)]
    pub compressed: bool,
}

/// Compressed wrapper metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingFrame {
    #[serde(default)]
    pub encoding: String,
    #[serde(default, rename = "originalType")]
    pub original_type: Option<String>,
    #[serde(default, rename = "originalLength", deserialize_with = "lenient::count")]
    pub original_length: u64,
    #[serde(default, rename = "compressedLength", deserialize_with = "lenient::count")]
    pub compressed_length: u64,
    #[serde(default)]
    pub payload: Value,
}

/// A decoded inbound frame together with its raw `type` tag.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: String,
    pub message: InboundMessage,
}

impl InboundMessage {
    /// Decode a text frame: parse, unwrap compression, then match the kind.
    pub fn decode(text: &str) -> Result<Frame> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FleetError::Decode(format!("not JSON: {e}")))?;
        Self::decode_value(value)
    }

    pub fn decode_value(value: Value) -> Result<Frame> {
        let value = codec::try_decompress(value);
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FleetError::Decode("frame has no type".into()))?
            .to_string();
        let message = serde_json::from_value(value)
            .map_err(|e| FleetError::Decode(format!("bad {kind} frame: {e}")))?;
        Ok(Frame { kind, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(v: Value) -> Frame {
        InboundMessage::decode(&v.to_string()).unwrap()
    }

    #[test]
    fn test_decode_telemetry_update() {
        let f = decode(json!({
            "type": "telemetry_update",
            "slave_id": "a1",
            "telemetry": {"remaining_charges": 7, "previewData": {"width": 2, "height": 2}}
        }));
        assert_eq!(f.kind, "telemetry_update");
        let InboundMessage::TelemetryUpdate { agent_id, telemetry } = f.message else {
            panic!("wrong variant");
        };
        assert_eq!(agent_id, "a1");
        assert_eq!(telemetry.remaining_charges, 7);
        assert!(telemetry.preview_data.is_some());
    }

    #[test]
    fn test_favorite_set_alias() {
        let f = decode(json!({"type": "favorite_set", "slave_id": "b"}));
        assert!(matches!(f.message, InboundMessage::SlaveFavorite { ref agent_id } if agent_id == "b"));
        assert_eq!(f.kind, "favorite_set");
    }

    #[test]
    fn test_unknown_kind() {
        let f = decode(json!({"type": "brand_new_thing", "x": 1}));
        assert!(matches!(f.message, InboundMessage::Unknown));
        assert_eq!(f.kind, "brand_new_thing");
    }

    #[test]
    fn test_missing_type_is_decode_error() {
        assert!(matches!(
            InboundMessage::decode(r#"{"slave_id":"a"}"#),
            Err(FleetError::Decode(_))
        ));
        assert!(InboundMessage::decode("not json").is_err());
    }

    #[test]
    fn test_compressed_frame_is_unwrapped() {
        let inner = json!({"type": "slave_connected", "slave_id": "z9"});
        let text = codec::compress_if_needed(&inner, 1);
        let f = InboundMessage::decode(&text).unwrap();
        assert_eq!(f.kind, "slave_connected");
        assert!(matches!(f.message, InboundMessage::SlaveConnected { ref agent_id } if agent_id == "z9"));
    }

    #[test]
    fn test_undecodable_wrapper_is_preserved() {
        let f = decode(json!({
            "type": "__compressed__",
            "encoding": "zstd",
            "originalType": "preview_data",
            "payload": "xyz"
        }));
        let InboundMessage::Compressed(pending) = f.message else {
            panic!("wrong variant");
        };
        assert_eq!(pending.encoding, "zstd");
        assert_eq!(pending.original_type.as_deref(), Some("preview_data"));
    }

    #[test]
    fn test_initial_state_skips_bad_entries() {
        let f = decode(json!({
            "type": "initial_state",
            "slaves": [
                {"id": "a", "status": "idle", "telemetry": {}, "is_favorite": true,
                 "connected_at": "2025-01-01T00:00:00", "last_seen": "2025-01-01T00:00:05.5"},
                {"no_id": true}
            ],
            "projects": [
                {"id": "p1", "name": "x", "mode": "Guard", "config": {}},
                {"id": "p2", "name": "y", "mode": "Farm", "config": {}}
            ],
            "sessions": [{"id": "s1", "project_id": "p1", "slave_ids": ["a"], "strategy": "balanced", "status": "running"}],
            "selected_slaves": ["a"],
            "available_colors": [{"id": 1, "r": 255, "g": 0, "b": 0}]
        }));
        let InboundMessage::InitialState(state) = f.message else {
            panic!("wrong variant");
        };
        assert_eq!(state.agents.len(), 1);
        assert!(state.agents[0].is_favorite);
        assert_eq!(state.projects.len(), 1);
        assert_eq!(state.sessions[0].agent_ids, vec!["a"]);
        assert_eq!(state.available_colors[0].r, 255);
    }

    #[test]
    fn test_paint_result_keeps_extra_fields() {
        let f = decode(json!({
            "type": "paint_result",
            "slave_id": "a",
            "ok": true,
            "coords": [{"x": 1, "y": 2}, {"x": 3, "y": 4}],
            "requestId": "r-1",
            "tileX": 10,
            "tileY": "11",
            "painted": 2
        }));
        let InboundMessage::PaintResult(r) = f.message else {
            panic!("wrong variant");
        };
        assert!(r.ok);
        assert_eq!(r.coords.len(), 2);
        assert_eq!(r.tile_y, 11);
        assert_eq!(r.extra.get("painted"), Some(&json!(2)));
    }

    #[test]
    fn test_repair_defaults() {
        let f = decode(json!({"type": "repair_error", "slave_id": "a"}));
        let InboundMessage::RepairError { error, source, .. } = f.message else {
            panic!("wrong variant");
        };
        assert_eq!(error, "Unknown error");
        assert_eq!(source, "unknown");
    }
}
