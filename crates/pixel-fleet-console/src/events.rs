//! Events published to console observers (CLI printer, tests, future UIs).

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use pixel_fleet_core::types::SessionStatus;
use pixel_fleet_preview::PreviewStats;

use crate::planner::RoundPlan;
use crate::registry::FleetAggregates;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsoleEvent {
    LinkUp {
        conn_id: String,
    },
    LinkDown {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    /// The link gave up; only a restart brings it back.
    LinkLost {
        attempts: u32,
    },
    /// Coordinator snapshot applied.
    Synced {
        agents: usize,
        projects: usize,
        session_id: Option<String>,
    },
    AgentsChanged(FleetAggregates),
    FavoriteChanged {
        agent_id: String,
    },
    SelectionChanged {
        agent_ids: Vec<String>,
    },
    PlanUpdated(RoundPlan),
    SessionChanged {
        session_id: String,
        status: SessionStatus,
    },
    PreviewUpdated(PreviewStats),
    /// Repair traffic for one agent (ack, progress, complete, error, suggestion).
    Repair {
        agent_id: String,
        stage: String,
        detail: Value,
    },
    Paint {
        agent_id: String,
        ok: bool,
        completed: u64,
        total: u64,
    },
    GuardConfig {
        config: Value,
    },
    GuardCleared {
        agent_ids: Vec<String>,
    },
    UploadSent {
        agent_id: Option<String>,
        filename: String,
        pixels: u64,
    },
    ProjectsChanged {
        count: usize,
    },
    /// Free-form log line from the coordinator or an agent.
    Log {
        level: String,
        message: String,
        agent_id: Option<String>,
    },
    /// A request failed; local state is unchanged.
    RequestFailed {
        operation: String,
        error: String,
    },
}

/// Send to every observer. No observers is fine.
pub fn publish(tx: &broadcast::Sender<ConsoleEvent>, event: ConsoleEvent) {
    match tx.send(event) {
        Ok(receivers) => debug!(receivers, "Published console event"),
        Err(_) => debug!("No console observers"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_shape() {
        let ev = ConsoleEvent::SessionChanged {
            session_id: "s1".into(),
            status: SessionStatus::Paused,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event": "session_changed", "session_id": "s1", "status": "paused"})
        );
    }

    #[test]
    fn test_publish_without_observers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        publish(&tx, ConsoleEvent::LinkDown { reason: "x".into() });

        let mut rx = tx.subscribe();
        publish(&tx, ConsoleEvent::LinkLost { attempts: 3 });
        assert_eq!(rx.try_recv().unwrap(), ConsoleEvent::LinkLost { attempts: 3 });
    }
}
