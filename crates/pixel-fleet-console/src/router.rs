//! Inbound message dispatch.
//!
//! One exhaustive match over [`InboundMessage`]. Each arm mutates the
//! context and returns the events observers should see; none of them fail.

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use pixel_fleet_core::protocol::{Frame, InboundMessage, InitialState};
use pixel_fleet_core::types::Telemetry;

use crate::events::ConsoleEvent;
use crate::state::ConsoleContext;

const UNKNOWN_KIND_TTL: Duration = Duration::from_secs(60);

pub fn dispatch(ctx: &mut ConsoleContext, frame: Frame, now: Instant) -> Vec<ConsoleEvent> {
    let mut out = Vec::new();
    match frame.message {
        InboundMessage::InitialState(state) => apply_initial_state(ctx, state, now, &mut out),

        InboundMessage::SlaveConnected { agent_id } | InboundMessage::SlaveReconnected { agent_id } => {
            ctx.registry.connect(&agent_id);
            fleet_changed(ctx, &mut out);
        }
        InboundMessage::SlaveDisconnected { agent_id } => {
            if ctx.registry.disconnect(&agent_id).is_some() {
                fleet_changed(ctx, &mut out);
            }
        }

        InboundMessage::UiSelectedSlaves { agent_ids } => {
            ctx.select(agent_ids.clone());
            out.push(ConsoleEvent::SelectionChanged { agent_ids });
            out.push(ConsoleEvent::PlanUpdated(ctx.replan().clone()));
        }

        InboundMessage::TelemetryUpdate { agent_id, telemetry } => {
            apply_telemetry(ctx, &agent_id, telemetry, now, &mut out);
        }
        InboundMessage::StatusUpdate { agent_id, status } => {
            if !ctx.registry.set_status(&agent_id, &status) {
                debug!(agent_id = %agent_id, "Status for unknown agent");
            }
        }
        InboundMessage::SlaveStatusUpdate { agent_id, status, telemetry } => {
            if let Some(telemetry) = telemetry {
                apply_telemetry(ctx, &agent_id, telemetry, now, &mut out);
            }
            ctx.registry.set_status(&agent_id, &status);
        }
        InboundMessage::SlaveFavorite { agent_id } => match ctx.registry.set_favorite(&agent_id) {
            Ok(()) => out.push(ConsoleEvent::FavoriteChanged { agent_id }),
            Err(e) => {
                ctx.throttle
                    .log_once_at(&format!("favorite:{agent_id}"), &e.to_string(), UNKNOWN_KIND_TTL, now);
            }
        },

        InboundMessage::PreviewData { agent_id, data } => {
            if is_preview_source(ctx, &agent_id) {
                out.push(ConsoleEvent::PreviewUpdated(ctx.preview.ingest(&data, now)));
            } else {
                debug!(agent_id = %agent_id, "Ignoring preview from non-favorite agent");
            }
        }

        InboundMessage::RepairSuggestion { agent_id, pixels, total_diffs } => {
            out.push(repair(&agent_id, "suggestion", json!({"pixels": pixels.len(), "total_diffs": total_diffs})));
        }
        InboundMessage::RepairAck { agent_id, total_repairs, source } => {
            out.push(repair(&agent_id, "ack", json!({"total_repairs": total_repairs, "source": source})));
        }
        InboundMessage::RepairProgress { agent_id, completed, total, source } => {
            out.push(repair(&agent_id, "progress", json!({"completed": completed, "total": total, "source": source})));
        }
        InboundMessage::RepairComplete { agent_id, completed, source } => {
            info!(agent_id = %agent_id, completed, %source, "Repair complete");
            out.push(repair(&agent_id, "complete", json!({"completed": completed, "source": source})));
        }
        InboundMessage::RepairError { agent_id, error, source } => {
            warn!(agent_id = %agent_id, %error, %source, "Repair failed");
            out.push(repair(&agent_id, "error", json!({"error": error, "source": source})));
        }

        InboundMessage::PaintProgress(p) => out.push(ConsoleEvent::Paint {
            agent_id: p.agent_id,
            ok: true,
            completed: p.completed,
            total: p.total,
        }),
        InboundMessage::PaintResult(r) => {
            if r.ok {
                ctx.preview.mark_repaired(&r.coords, now);
            }
            let painted = r.coords.len() as u64;
            out.push(ConsoleEvent::Paint {
                agent_id: r.agent_id,
                ok: r.ok,
                completed: if r.ok { painted } else { 0 },
                total: painted,
            });
        }

        InboundMessage::GuardConfig { config, changed } => {
            debug!(changed = %changed, "Guard config pushed");
            ctx.guard_config = config.clone();
            out.push(ConsoleEvent::GuardConfig { config });
            out.push(ConsoleEvent::PlanUpdated(ctx.replan().clone()));
        }
        InboundMessage::GuardCleared { cleared_agents, guard_data_cleared } => {
            if guard_data_cleared {
                ctx.registry.clear_guard_data();
                ctx.preview.clear();
            }
            out.push(ConsoleEvent::GuardCleared { agent_ids: cleared_agents });
            out.push(ConsoleEvent::AgentsChanged(ctx.registry.aggregates()));
        }
        InboundMessage::GuardUploadSent(sent) => {
            info!(
                agent_id = sent.agent_id.as_deref().unwrap_or("-"),
                filename = %sent.filename,
                pixels = sent.pixels,
                compressed = sent.compressed,
                "Guard upload forwarded"
            );
            out.push(ConsoleEvent::UploadSent {
                agent_id: sent.agent_id,
                filename: sent.filename,
                pixels: sent.pixels,
            });
        }

        InboundMessage::ProjectCreated { project_id, project } => {
            if let Some(mut project) = project {
                if project.id.is_empty() {
                    project.id = project_id;
                }
                ctx.projects.retain(|p| p.id != project.id);
                ctx.projects.push(project);
            }
            out.push(ConsoleEvent::ProjectsChanged { count: ctx.projects.len() });
        }
        InboundMessage::ProjectDeleted { project_id } => {
            ctx.projects.retain(|p| p.id != project_id);
            if ctx.controller.forget_project(&project_id) {
                info!(%project_id, "Active session's project deleted");
            }
            out.push(ConsoleEvent::ProjectsChanged { count: ctx.projects.len() });
        }
        InboundMessage::ProjectsCleared { projects_deleted, sessions_deleted } => {
            info!(projects_deleted, sessions_deleted, "Coordinator cleared all projects");
            ctx.projects.clear();
            ctx.controller.reset();
            out.push(ConsoleEvent::ProjectsChanged { count: 0 });
        }

        InboundMessage::Log { level, message, agent_id } => {
            let level = level.unwrap_or_else(|| "info".into());
            debug!(%level, agent_id = agent_id.as_deref().unwrap_or("-"), "{message}");
            out.push(ConsoleEvent::Log { level, message, agent_id });
        }

        InboundMessage::Compressed(pending) => {
            let original = pending.original_type.as_deref().unwrap_or("?");
            ctx.throttle.log_once_at(
                &format!("compressed:{original}"),
                &format!(
                    "Undecodable {} frame ({original}, {} bytes), dropped",
                    pending.encoding, pending.compressed_length
                ),
                UNKNOWN_KIND_TTL,
                now,
            );
        }
        InboundMessage::Unknown => {
            ctx.throttle.log_once_at(
                &format!("kind:{}", frame.kind),
                &format!("Unhandled message kind '{}'", frame.kind),
                UNKNOWN_KIND_TTL,
                now,
            );
        }
    }
    out
}

fn apply_initial_state(
    ctx: &mut ConsoleContext,
    state: InitialState,
    now: Instant,
    out: &mut Vec<ConsoleEvent>,
) {
    ctx.registry.apply_snapshot(state.agents);
    ctx.preview.set_palette(&state.available_colors);
    ctx.projects = state.projects;

    let adopted = ctx
        .controller
        .adopt(&state.sessions, &ctx.projects)
        .map(|s| (s.id.clone(), s.status));
    match &adopted {
        Some(_) => ctx.persist_selection(),
        None if !state.selected_agents.is_empty() => ctx.select(state.selected_agents),
        None => {}
    }
    ctx.preview.set_mode_hint(ctx.controller.mode());

    // a favorite's telemetry may already carry a preview
    let preview = ctx
        .registry
        .favorite()
        .and_then(|a| a.telemetry.preview_data.clone());
    if let Some(data) = preview {
        out.push(ConsoleEvent::PreviewUpdated(ctx.preview.ingest(&data, now)));
    }

    info!(
        agents = ctx.registry.len(),
        projects = ctx.projects.len(),
        session = adopted.as_ref().map(|(id, _)| id.as_str()).unwrap_or("-"),
        "Coordinator state synced"
    );
    out.push(ConsoleEvent::Synced {
        agents: ctx.registry.len(),
        projects: ctx.projects.len(),
        session_id: adopted.as_ref().map(|(id, _)| id.clone()),
    });
    if let Some((session_id, status)) = adopted {
        out.push(ConsoleEvent::SessionChanged { session_id, status });
    }
    out.push(ConsoleEvent::SelectionChanged {
        agent_ids: ctx.controller.selection().to_vec(),
    });
    fleet_changed(ctx, out);
}

fn apply_telemetry(
    ctx: &mut ConsoleContext,
    agent_id: &str,
    mut telemetry: Telemetry,
    now: Instant,
    out: &mut Vec<ConsoleEvent>,
) {
    // preview payloads go to the engine, not the registry
    let preview = telemetry.preview_data.take();
    ctx.registry.update_telemetry(agent_id, telemetry);
    if let Some(data) = preview.filter(|d| !d.is_null()) {
        if is_preview_source(ctx, agent_id) {
            out.push(ConsoleEvent::PreviewUpdated(ctx.preview.ingest(&data, now)));
        }
    }
    fleet_changed(ctx, out);
}

/// Previews come from the favorite, or from anyone while there is none.
fn is_preview_source(ctx: &ConsoleContext, agent_id: &str) -> bool {
    ctx.registry
        .favorite()
        .is_none_or(|fav| fav.id == agent_id)
}

fn fleet_changed(ctx: &mut ConsoleContext, out: &mut Vec<ConsoleEvent>) {
    out.push(ConsoleEvent::AgentsChanged(ctx.registry.aggregates()));
    out.push(ConsoleEvent::PlanUpdated(ctx.replan().clone()));
}

fn repair(agent_id: &str, stage: &str, detail: Value) -> ConsoleEvent {
    ConsoleEvent::Repair {
        agent_id: agent_id.to_string(),
        stage: stage.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pixel_fleet_core::client_state::ClientStateStore;
    use pixel_fleet_core::config::Config;
    use pixel_fleet_core::types::SessionStatus;

    fn context(dir: &tempfile::TempDir) -> ConsoleContext {
        ConsoleContext::new(
            Arc::new(Config::default()),
            ClientStateStore::new(dir.path().join("state.json")),
        )
    }

    fn send(ctx: &mut ConsoleContext, v: Value) -> Vec<ConsoleEvent> {
        let frame = InboundMessage::decode(&v.to_string()).unwrap();
        dispatch(ctx, frame, Instant::now())
    }

    fn initial_state() -> Value {
        json!({
            "type": "initial_state",
            "slaves": [
                {"id": "a", "status": "idle", "telemetry": {"remaining_charges": 12}, "is_favorite": true,
                 "connected_at": "2025-01-01T10:00:00", "last_seen": "2025-01-01T10:00:05.123456"},
                {"id": "b", "telemetry": {"remainingCharges": 3}}
            ],
            "projects": [{"id": "p1", "name": "wall", "mode": "Guard", "config": {}},
                         {"id": "p2", "name": "farm", "mode": "Farm", "config": {}}],
            "sessions": [{"id": "s1", "project_id": "p1", "slave_ids": ["a", "b"], "strategy": "balanced", "status": "paused"}],
            "selected_slaves": ["a"],
            "available_colors": [{"id": 1, "r": 0, "g": 0, "b": 0}]
        })
    }

    #[test]
    fn test_initial_state_adopts_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        let events = send(&mut ctx, initial_state());

        assert_eq!(ctx.registry.len(), 2);
        assert_eq!(ctx.projects.len(), 1);
        assert_eq!(ctx.controller.status(), Some(SessionStatus::Paused));
        // session agents win over the coordinator's UI selection
        assert_eq!(ctx.controller.selection(), ["a", "b"]);
        assert_eq!(ctx.plan.total, 13);
        assert!(events.contains(&ConsoleEvent::SessionChanged {
            session_id: "s1".into(),
            status: SessionStatus::Paused
        }));
        assert_eq!(ctx.client_state.load().selected_agents, ["a", "b"]);
    }

    #[test]
    fn test_initial_state_without_session_uses_selected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        let mut state = initial_state();
        state["sessions"] = json!([]);
        send(&mut ctx, state);
        assert!(ctx.controller.active().is_none());
        assert_eq!(ctx.controller.selection(), ["a"]);
    }

    #[test]
    fn test_telemetry_replans_and_routes_preview() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, initial_state());
        let events = send(
            &mut ctx,
            json!({
                "type": "telemetry_update",
                "slave_id": "a",
                "telemetry": {
                    "remaining_charges": 4,
                    "previewData": {
                        "area": {"x": 0, "y": 0, "width": 2, "height": 1},
                        "correctPixels": [{"x": 0, "y": 0}],
                        "missingPixels": [{"x": 1, "y": 0}]
                    }
                }
            }),
        );
        assert_eq!(ctx.registry.aggregates().remaining_charges, 7);
        assert_eq!(ctx.plan.quota("a"), Some(4));
        assert!(ctx.registry.get("a").unwrap().telemetry.preview_data.is_none());
        let stats = ctx.preview.stats().unwrap();
        assert_eq!((stats.correct, stats.missing), (1, 1));
        assert!(events.iter().any(|e| matches!(e, ConsoleEvent::PreviewUpdated(_))));
    }

    #[test]
    fn test_preview_from_non_favorite_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, initial_state());
        send(&mut ctx, json!({"type": "preview_data", "slave_id": "b", "data": {"missingPixels": [{"x": 0, "y": 0}]}}));
        assert!(ctx.preview.stats().is_none());
        send(&mut ctx, json!({"type": "preview_data", "slave_id": "a", "data": {"missingPixels": [{"x": 0, "y": 0}]}}));
        assert_eq!(ctx.preview.stats().unwrap().missing, 1);
    }

    #[test]
    fn test_favorite_events_keep_single_favorite() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, initial_state());
        send(&mut ctx, json!({"type": "favorite_set", "slave_id": "b"}));
        send(&mut ctx, json!({"type": "slave_favorite", "slave_id": "nobody"}));
        assert_eq!(ctx.registry.favorite().unwrap().id, "b");
        assert_eq!(ctx.registry.agents().filter(|a| a.favorite).count(), 1);
    }

    #[test]
    fn test_connect_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, json!({"type": "slave_connected", "slave_id": "z"}));
        assert!(ctx.registry.contains("z"));
        send(&mut ctx, json!({"type": "slave_disconnected", "slave_id": "z"}));
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_unknown_kind_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        assert!(send(&mut ctx, json!({"type": "brand_new_kind", "x": 1})).is_empty());
        assert!(send(&mut ctx, json!({"type": "__compressed__", "encoding": "zstd", "payload": 5})).is_empty());
    }

    #[test]
    fn test_paint_result_marks_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, json!({"type": "paint_result", "slave_id": "a", "ok": true, "coords": [{"x": 1, "y": 2}, {"x": 3, "y": 4}]}));
        send(&mut ctx, json!({"type": "paint_result", "slave_id": "a", "ok": false, "coords": [{"x": 9, "y": 9}]}));
        assert_eq!(ctx.preview.recent_repair_count(Instant::now()), 2);
    }

    #[test]
    fn test_projects_cleared_resets_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, initial_state());
        send(&mut ctx, json!({"type": "projects_cleared", "projects_deleted": 1, "sessions_deleted": 1}));
        assert!(ctx.projects.is_empty());
        assert!(ctx.controller.active().is_none());
    }

    #[test]
    fn test_guard_cleared_resets_preview() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        send(&mut ctx, initial_state());
        send(&mut ctx, json!({"type": "preview_data", "slave_id": "a", "data": {"missingPixels": [{"x": 0, "y": 0}]}}));
        send(&mut ctx, json!({"type": "guard_cleared", "cleared_slaves": ["a"], "guardDataCleared": true}));
        assert!(ctx.preview.stats().is_none());
    }
}
