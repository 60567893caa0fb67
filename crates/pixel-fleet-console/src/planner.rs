//! Advisory batch planning.
//!
//! Nothing here is enforced; the coordinator does its own assignment. The
//! plan only drives what the operator sees before pressing "one batch".

use serde::Serialize;
use serde_json::Value;

use pixel_fleet_core::types::lenient;

use crate::registry::AgentRegistry;

/// Per-batch pixel count the coordinator uses when its guard config has none.
pub const DEFAULT_PIXELS_PER_BATCH: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentQuota {
    pub agent_id: String,
    pub remaining_charges: u64,
    pub quota: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundPlan {
    pub quotas: Vec<AgentQuota>,
    pub total: u64,
    pub batch_cap: u64,
    /// How the coordinator would spread its next round, if it ran now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Distribution>,
}

impl RoundPlan {
    /// Quota per selected agent: `min(remaining_charges, batch_cap)`.
    /// Selected ids the registry doesn't know are skipped.
    pub fn compute(registry: &AgentRegistry, selected: &[String], batch_cap: u64) -> Self {
        let quotas: Vec<AgentQuota> = selected
            .iter()
            .filter_map(|id| registry.get(id))
            .map(|agent| {
                let remaining = agent.telemetry.remaining_charges;
                AgentQuota {
                    agent_id: agent.id.clone(),
                    remaining_charges: remaining,
                    quota: remaining.min(batch_cap),
                }
            })
            .collect();
        let total = quotas.iter().fold(0u64, |acc, q| acc.saturating_add(q.quota));
        Self {
            quotas,
            total,
            batch_cap,
            projection: None,
        }
    }

    /// Attach the coordinator-side projection for the same agents.
    pub fn with_projection(mut self, params: DistributionParams) -> Self {
        let charges: Vec<(String, u64)> = self
            .quotas
            .iter()
            .map(|q| (q.agent_id.clone(), q.remaining_charges))
            .collect();
        self.projection = Some(project_distribution(&charges, params, None));
        self
    }

    pub fn quota(&self, agent_id: &str) -> Option<u64> {
        self.quotas
            .iter()
            .find(|q| q.agent_id == agent_id)
            .map(|q| q.quota)
    }
}

/// Round sizing knobs read from the coordinator's guard config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionParams {
    pub pixels_per_batch: u64,
    pub spend_all: bool,
}

impl Default for DistributionParams {
    fn default() -> Self {
        Self {
            pixels_per_batch: DEFAULT_PIXELS_PER_BATCH,
            spend_all: false,
        }
    }
}

impl DistributionParams {
    pub fn from_guard_config(config: &Value) -> Self {
        let pixels_per_batch = match lenient::count_of(config.get("pixelsPerBatch").unwrap_or(&Value::Null)) {
            0 => DEFAULT_PIXELS_PER_BATCH,
            n => n,
        };
        let spend_all = config
            .get("spendAllPixelsOnStart")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            pixels_per_batch,
            spend_all,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Distribution {
    pub round_total: u64,
    /// Agent id and assigned pixels, in input order, including zeros.
    pub plan: Vec<(String, u64)>,
    pub assigned: u64,
    /// Pixels that would actually be sent once capped by available changes.
    pub pick: u64,
}

/// Round-robin one unit at a time over agents with charge, never giving an
/// agent more than its charges, until the round total is assigned.
///
/// The round total is every charge when `spend_all`, else
/// `min(sum of charges, pixels_per_batch)`. `available_changes` caps the
/// final pick when known.
pub fn project_distribution(
    charges: &[(String, u64)],
    params: DistributionParams,
    available_changes: Option<u64>,
) -> Distribution {
    let sum = charges.iter().fold(0u64, |acc, (_, c)| acc.saturating_add(*c));
    let round_total = if params.spend_all {
        sum
    } else {
        sum.min(params.pixels_per_batch)
    };

    // Whole round-robin cycles first: after `level` cycles every agent holds
    // min(charges, level). The partial cycle then goes to agents in order.
    let filled = |level: u64| {
        charges
            .iter()
            .fold(0u64, |acc, (_, c)| acc.saturating_add((*c).min(level)))
    };
    let (mut lo, mut hi) = (0u64, charges.iter().map(|(_, c)| *c).max().unwrap_or(0));
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if filled(mid) <= round_total {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let level = lo;

    let mut plan: Vec<(String, u64)> = charges
        .iter()
        .map(|(id, c)| (id.clone(), (*c).min(level)))
        .collect();
    let mut assigned = filled(level);
    for (slot, (_, c)) in plan.iter_mut().zip(charges) {
        if assigned >= round_total {
            break;
        }
        if *c > level {
            slot.1 += 1;
            assigned += 1;
        }
    }

    let pick = available_changes.map_or(assigned, |n| n.min(assigned));
    Distribution {
        round_total,
        plan,
        assigned,
        pick,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixel_fleet_core::types::Telemetry;
    use serde_json::json;

    fn registry(charges: &[(&str, u64)]) -> AgentRegistry {
        let mut reg = AgentRegistry::new();
        for (id, c) in charges {
            reg.update_telemetry(id, Telemetry::from_value(json!({"remaining_charges": c})));
        }
        reg
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn charges(v: &[(&str, u64)]) -> Vec<(String, u64)> {
        v.iter().map(|(id, c)| (id.to_string(), *c)).collect()
    }

    #[test]
    fn test_quota_capped() {
        let reg = registry(&[("a", 25), ("b", 3), ("c", 0)]);
        let plan = RoundPlan::compute(&reg, &ids(&["a", "b", "c", "ghost"]), 10);
        assert_eq!(plan.quota("a"), Some(10));
        assert_eq!(plan.quota("b"), Some(3));
        assert_eq!(plan.quota("c"), Some(0));
        assert_eq!(plan.quota("ghost"), None);
        assert_eq!(plan.total, 13);
        for q in &plan.quotas {
            assert!(q.quota <= q.remaining_charges.min(10));
        }
    }

    #[test]
    fn test_unselected_agents_ignored() {
        let reg = registry(&[("a", 4), ("b", 9)]);
        let plan = RoundPlan::compute(&reg, &ids(&["b"]), 10);
        assert_eq!(plan.quotas.len(), 1);
        assert_eq!(plan.total, 9);
    }

    #[test]
    fn test_distribution_round_robin() {
        let d = project_distribution(
            &charges(&[("a", 5), ("b", 1), ("c", 0), ("d", 5)]),
            DistributionParams::default(),
            None,
        );
        assert_eq!(d.round_total, 10);
        assert_eq!(d.assigned, 10);
        assert_eq!(
            d.plan,
            charges(&[("a", 5), ("b", 1), ("c", 0), ("d", 4)])
        );
    }

    #[test]
    fn test_distribution_spend_all() {
        let params = DistributionParams { pixels_per_batch: 2, spend_all: true };
        let d = project_distribution(&charges(&[("a", 3), ("b", 4)]), params, Some(5));
        assert_eq!(d.round_total, 7);
        assert_eq!(d.assigned, 7);
        assert_eq!(d.pick, 5);
    }

    #[test]
    fn test_distribution_no_charges() {
        let d = project_distribution(&charges(&[("a", 0)]), DistributionParams::default(), None);
        assert_eq!(d.round_total, 0);
        assert_eq!(d.assigned, 0);
        assert_eq!(d.plan, charges(&[("a", 0)]));
    }

    #[test]
    fn test_params_from_guard_config() {
        let p = DistributionParams::from_guard_config(&json!({"pixelsPerBatch": "25", "spendAllPixelsOnStart": true}));
        assert_eq!(p, DistributionParams { pixels_per_batch: 25, spend_all: true });
        assert_eq!(DistributionParams::from_guard_config(&json!({})), DistributionParams::default());
    }

    #[test]
    fn test_with_projection() {
        let reg = registry(&[("a", 8), ("b", 8)]);
        let plan = RoundPlan::compute(&reg, &ids(&["a", "b"]), 10).with_projection(DistributionParams::default());
        let projection = plan.projection.unwrap();
        assert_eq!(projection.plan, charges(&[("a", 5), ("b", 5)]));
    }

    #[test]
    fn test_distribution_huge_charges_saturate() {
        let params = DistributionParams { pixels_per_batch: 10, spend_all: true };
        let d = project_distribution(&charges(&[("a", u64::MAX), ("b", 5)]), params, Some(3));
        assert_eq!(d.round_total, u64::MAX);
        assert_eq!(d.plan[1], ("b".to_string(), 5));
        assert_eq!(d.assigned, u64::MAX);
        assert_eq!(d.pick, 3);

        let d = project_distribution(&charges(&[("a", u64::MAX), ("b", 5)]), DistributionParams::default(), None);
        assert_eq!(d.plan, charges(&[("a", 5), ("b", 5)]));
    }

    #[test]
    fn test_quota_total_saturates() {
        let mut reg = AgentRegistry::new();
        reg.update_telemetry("a", Telemetry::from_value(json!({"remaining_charges": 1e30})));
        reg.update_telemetry("b", Telemetry::from_value(json!({"remaining_charges": 1e30})));
        let plan = RoundPlan::compute(&reg, &ids(&["a", "b"]), u64::MAX);
        assert_eq!(plan.total, u64::MAX);
    }
}
