//! Agent registry: who is connected, what they last reported, who is favorite.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use pixel_fleet_core::error::{FleetError, Result};
use pixel_fleet_core::types::{Agent, AgentSnapshot, AnalysisSummary, Telemetry};

/// Fleet-wide totals, recomputed from scratch on every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetAggregates {
    pub agents: usize,
    pub remaining_charges: u64,
    pub max_charges: u64,
    pub repaired: u64,
    pub correct: u64,
    pub incorrect: u64,
    pub missing: u64,
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Agent>,
    /// Latest agent-computed Guard analysis. Replaces, rather than adds to,
    /// the summed correct/incorrect/missing counts.
    guard_override: Option<AnalysisSummary>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a (re)connected agent. A reconnect keeps its last telemetry.
    pub fn connect(&mut self, id: &str) {
        let agent = self
            .agents
            .entry(id.to_string())
            .or_insert_with(|| Agent::new(id));
        agent.connected = true;
        agent.last_seen = Utc::now();
        info!(agent_id = %id, "Agent connected");
    }

    pub fn disconnect(&mut self, id: &str) -> Option<Agent> {
        let removed = self.agents.remove(id);
        if removed.is_some() {
            info!(agent_id = %id, "Agent disconnected");
        }
        removed
    }

    /// Replace the agent's telemetry wholesale. Unknown agents are added.
    pub fn update_telemetry(&mut self, id: &str, telemetry: Telemetry) {
        if let Some(summary) = telemetry.analysis {
            self.guard_override = Some(summary);
        }
        let agent = self
            .agents
            .entry(id.to_string())
            .or_insert_with(|| Agent::new(id));
        agent.telemetry = telemetry;
        agent.last_seen = Utc::now();
    }

    pub fn set_status(&mut self, id: &str, status: &str) -> bool {
        match self.agents.get_mut(id) {
            Some(agent) => {
                agent.status = status.to_string();
                agent.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Make `id` the only favorite.
    pub fn set_favorite(&mut self, id: &str) -> Result<()> {
        if !self.agents.contains_key(id) {
            return Err(FleetError::UnknownAgent(id.to_string()));
        }
        for (agent_id, agent) in self.agents.iter_mut() {
            agent.favorite = agent_id == id;
        }
        debug!(agent_id = %id, "Favorite set");
        Ok(())
    }

    pub fn favorite(&self) -> Option<&Agent> {
        self.agents.values().find(|a| a.favorite)
    }

    /// Replace everything with the coordinator's snapshot. If the snapshot
    /// marks several favorites, the first listed keeps it.
    pub fn apply_snapshot(&mut self, snapshot: Vec<AgentSnapshot>) {
        self.agents.clear();
        self.guard_override = None;
        let mut favorite_seen = false;
        for entry in snapshot {
            let mut agent = entry.into_agent();
            if agent.favorite {
                if favorite_seen {
                    agent.favorite = false;
                }
                favorite_seen = true;
            }
            if let Some(summary) = agent.telemetry.analysis {
                self.guard_override = Some(summary);
            }
            self.agents.insert(agent.id.clone(), agent);
        }
    }

    /// Forget Guard analysis after the coordinator cleared guard data.
    pub fn clear_guard_data(&mut self) {
        self.guard_override = None;
        for agent in self.agents.values_mut() {
            agent.telemetry.analysis = None;
            agent.telemetry.correct_pixels = 0;
            agent.telemetry.incorrect_pixels = 0;
            agent.telemetry.missing_pixels = 0;
        }
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn aggregates(&self) -> FleetAggregates {
        let mut totals = self.agents.values().fold(
            FleetAggregates {
                agents: self.agents.len(),
                ..FleetAggregates::default()
            },
            |mut acc, agent| {
                let t = &agent.telemetry;
                acc.remaining_charges = acc.remaining_charges.saturating_add(t.remaining_charges);
                acc.max_charges = acc.max_charges.saturating_add(t.max_charges);
                acc.repaired = acc.repaired.saturating_add(t.repaired_pixels);
                acc.correct = acc.correct.saturating_add(t.correct_pixels);
                acc.incorrect = acc.incorrect.saturating_add(t.incorrect_pixels);
                acc.missing = acc.missing.saturating_add(t.missing_pixels);
                acc
            },
        );
        if let Some(summary) = self.guard_override {
            totals.correct = summary.correct;
            totals.incorrect = summary.incorrect;
            totals.missing = summary.missing;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn telemetry(v: serde_json::Value) -> Telemetry {
        Telemetry::from_value(v)
    }

    #[test]
    fn test_remaining_charges_sum_latest() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 5})));
        reg.update_telemetry("b", telemetry(json!({"remaining_charges": 7})));
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 2})));
        assert_eq!(reg.aggregates().remaining_charges, 9);
        assert_eq!(reg.aggregates().agents, 2);
    }

    #[test]
    fn test_telemetry_replaced_not_merged() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 5, "repaired_pixels": 40})));
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 3})));
        let t = &reg.get("a").unwrap().telemetry;
        assert_eq!(t.remaining_charges, 3);
        assert_eq!(t.repaired_pixels, 0);
    }

    #[test]
    fn test_favorite_exclusive() {
        let mut reg = AgentRegistry::new();
        for id in ["a", "b", "c"] {
            reg.connect(id);
        }
        assert!(reg.favorite().is_none());
        reg.set_favorite("a").unwrap();
        reg.set_favorite("c").unwrap();
        reg.set_favorite("b").unwrap();
        assert_eq!(reg.agents().filter(|a| a.favorite).count(), 1);
        assert_eq!(reg.favorite().unwrap().id, "b");
    }

    #[test]
    fn test_favorite_unknown_agent_rejected() {
        let mut reg = AgentRegistry::new();
        reg.connect("a");
        reg.set_favorite("a").unwrap();
        assert!(matches!(reg.set_favorite("zz"), Err(FleetError::UnknownAgent(_))));
        assert_eq!(reg.favorite().unwrap().id, "a");
    }

    #[test]
    fn test_analysis_overrides_guard_counts() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", telemetry(json!({"correct_pixels": 10, "incorrect_pixels": 4, "missing_pixels": 1})));
        reg.update_telemetry("b", telemetry(json!({"correct_pixels": 20, "repaired_pixels": 3})));
        let agg = reg.aggregates();
        assert_eq!((agg.correct, agg.incorrect, agg.missing), (30, 4, 1));

        reg.update_telemetry(
            "b",
            telemetry(json!({"repaired_pixels": 3, "analysis": {"correct": 90, "incorrect": 6, "missing": 2}})),
        );
        let agg = reg.aggregates();
        assert_eq!((agg.correct, agg.incorrect, agg.missing), (90, 6, 2));
        assert_eq!(agg.repaired, 3);

        reg.update_telemetry("a", telemetry(json!({"analysisSummary": {"correctPixels": 91, "incorrectPixels": 5, "missingPixels": 2}})));
        assert_eq!(reg.aggregates().correct, 91);
    }

    #[test]
    fn test_reconnect_keeps_telemetry_disconnect_removes() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 8})));
        reg.connect("a");
        assert_eq!(reg.get("a").unwrap().telemetry.remaining_charges, 8);
        assert!(reg.disconnect("a").is_some());
        assert!(reg.disconnect("a").is_none());
        assert_eq!(reg.aggregates().remaining_charges, 0);
    }

    #[test]
    fn test_snapshot_single_favorite() {
        let snapshot: Vec<AgentSnapshot> = serde_json::from_value(json!([
            {"id": "a", "is_favorite": true, "telemetry": {"remaining_charges": 1}},
            {"id": "b", "is_favorite": true},
            {"id": "c"}
        ]))
        .unwrap();
        let mut reg = AgentRegistry::new();
        reg.connect("stale");
        reg.apply_snapshot(snapshot);
        assert!(!reg.contains("stale"));
        assert_eq!(reg.favorite().unwrap().id, "a");
        assert_eq!(reg.agents().filter(|a| a.favorite).count(), 1);
    }

    #[test]
    fn test_clear_guard_data() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 4, "analysis": {"correct": 9}})));
        reg.clear_guard_data();
        let agg = reg.aggregates();
        assert_eq!(agg.correct, 0);
        assert_eq!(agg.remaining_charges, 4);
    }

    #[test]
    fn test_aggregates_saturate_on_huge_counts() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", telemetry(json!({"remaining_charges": 1e30, "repaired_pixels": 1e30})));
        reg.update_telemetry("b", telemetry(json!({"remaining_charges": 5, "repaired_pixels": 5})));
        let agg = reg.aggregates();
        assert_eq!(agg.remaining_charges, u64::MAX);
        assert_eq!(agg.repaired, u64::MAX);
        assert_eq!(agg.agents, 2);
    }
}
