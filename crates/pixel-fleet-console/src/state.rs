//! Console state, owned by the event loop.
//!
//! Every component gets its settings from the [`Config`] passed in here;
//! nothing is global.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use pixel_fleet_core::client_state::ClientStateStore;
use pixel_fleet_core::config::Config;
use pixel_fleet_core::throttle::LogThrottle;
use pixel_fleet_core::types::Project;
use pixel_fleet_preview::PreviewEngine;

use crate::controller::SessionController;
use crate::planner::{DistributionParams, RoundPlan};
use crate::registry::AgentRegistry;

pub struct ConsoleContext {
    pub config: Arc<Config>,
    pub registry: AgentRegistry,
    pub controller: SessionController,
    pub preview: PreviewEngine,
    pub plan: RoundPlan,
    pub throttle: LogThrottle,
    pub client_state: ClientStateStore,
    pub projects: Vec<Project>,
    /// Coordinator-side guard settings, as last pushed or fetched.
    pub guard_config: Value,
}

impl ConsoleContext {
    pub fn new(config: Arc<Config>, client_state: ClientStateStore) -> Self {
        let throttle = config.throttle();
        let mut controller = SessionController::new();
        controller.set_selection(client_state.load().selected_agents);
        Self {
            registry: AgentRegistry::new(),
            controller,
            preview: PreviewEngine::new(&config.preview()),
            plan: RoundPlan::default(),
            throttle: LogThrottle::new(
                throttle.capacity,
                Duration::from_millis(throttle.default_ttl_ms),
            ),
            client_state,
            projects: Vec::new(),
            guard_config: Value::Null,
            config,
        }
    }

    /// Recompute the advisory plan from the current registry and selection.
    pub fn replan(&mut self) -> &RoundPlan {
        self.plan = RoundPlan::compute(
            &self.registry,
            self.controller.selection(),
            self.config.batch_cap(),
        )
        .with_projection(DistributionParams::from_guard_config(&self.guard_config));
        &self.plan
    }

    /// Change the local selection and remember it across restarts.
    pub fn select(&mut self, agent_ids: Vec<String>) {
        self.controller.set_selection(agent_ids);
        self.persist_selection();
    }

    pub fn persist_selection(&self) {
        let selected = self.controller.selection().to_vec();
        if let Err(e) = self.client_state.update(|s| s.selected_agents = selected) {
            warn!(%e, "Failed to persist selection");
        }
    }
}
