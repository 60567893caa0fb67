//! Session lifecycle as seen by the console.
//!
//! Local status only moves after the coordinator confirms a request. The
//! controller is split in two halves around each request: `begin_*` checks
//! the transition is allowed and marks the operation in flight, `complete_*`
//! applies the confirmed result. The request itself runs between them,
//! outside the controller, so the event loop keeps turning meanwhile.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use pixel_fleet_core::error::{FleetError, Result};
use pixel_fleet_core::types::{
    Project, ProjectMode, SessionAction, SessionRecord, SessionStatus, Strategy,
};

use crate::coordinator::Coordinator;

/// What the operator asked to start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub name: String,
    pub mode: ProjectMode,
    pub config: Value,
    pub strategy: Strategy,
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub project: Project,
    pub session: SessionRecord,
}

/// Persist selection, create project, create session, start it.
///
/// Stops at the first failing step; nothing after it is attempted.
pub async fn run_start_sequence(
    coordinator: &dyn Coordinator,
    request: StartRequest,
) -> Result<StartOutcome> {
    coordinator.update_selection(&request.agent_ids).await?;
    let project = coordinator
        .create_project(&request.name, request.mode, &request.config)
        .await?;
    let session = coordinator
        .create_session(&project.id, &request.agent_ids, request.strategy)
        .await?;
    coordinator.start_session(&session.id).await?;
    Ok(StartOutcome { project, session })
}

/// How a start request will be carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPlan {
    /// Run the full sequence and create a new session.
    New,
    /// The current session was created but never started; start that one.
    Existing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    Start,
    Action(SessionAction),
}

#[derive(Debug, Default)]
pub struct SessionController {
    active: Option<ActiveSession>,
    mode: Option<ProjectMode>,
    selection: Vec<String>,
    in_flight: Option<InFlight>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.active.as_ref().map(|s| s.status)
    }

    pub fn mode(&self) -> Option<ProjectMode> {
        self.mode
    }

    pub fn selection(&self) -> &[String] {
        &self.selection
    }

    pub fn set_selection(&mut self, agent_ids: Vec<String>) {
        self.selection = agent_ids;
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Adopt the coordinator's session after a (re)connect: running first,
    /// then paused, then whatever else is listed. Its agents become the
    /// local selection.
    pub fn adopt(&mut self, sessions: &[SessionRecord], projects: &[Project]) -> Option<&ActiveSession> {
        let pick = sessions
            .iter()
            .find(|s| s.status == SessionStatus::Running)
            .or_else(|| sessions.iter().find(|s| s.status == SessionStatus::Paused))
            .or_else(|| sessions.first())?;

        info!(session_id = %pick.id, status = %pick.status, "Adopting coordinator session");
        self.mode = projects
            .iter()
            .find(|p| p.id == pick.project_id)
            .map(|p| p.mode)
            .or(self.mode);
        self.selection = pick.agent_ids.clone();
        self.active = Some(ActiveSession {
            id: pick.id.clone(),
            project_id: pick.project_id.clone(),
            status: pick.status,
            agent_ids: pick.agent_ids.clone(),
        });
        self.active.as_ref()
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(FleetError::Request("another session request is in flight".into()));
        }
        Ok(())
    }

    /// A start is allowed with no session, after the last one stopped, or
    /// on a session the coordinator created but never started. Only the
    /// last case reuses the session.
    pub fn begin_start(&mut self, request: &StartRequest) -> Result<StartPlan> {
        self.ensure_idle()?;
        if let Some(active) = &self.active {
            if active.status == SessionStatus::Created {
                let id = active.id.clone();
                self.in_flight = Some(InFlight::Action(SessionAction::Start));
                return Ok(StartPlan::Existing(id));
            }
            if !active.status.is_terminal() {
                return Err(FleetError::Transition {
                    from: active.status.to_string(),
                    action: SessionAction::Start.to_string(),
                });
            }
        }
        if request.agent_ids.is_empty() {
            return Err(FleetError::Request("no agents selected".into()));
        }
        self.in_flight = Some(InFlight::Start);
        Ok(StartPlan::New)
    }

    pub fn complete_start(&mut self, result: Result<StartOutcome>) -> Result<&ActiveSession> {
        self.in_flight = None;
        let outcome = result.inspect_err(|e| warn!(%e, "Session start failed"))?;
        let status = outcome.session.status.transition(SessionAction::Start)?;
        info!(session_id = %outcome.session.id, project_id = %outcome.project.id, "Session running");
        self.mode = Some(outcome.project.mode);
        self.selection = outcome.session.agent_ids.clone();
        let active = self.active.insert(ActiveSession {
            id: outcome.session.id,
            project_id: outcome.project.id,
            status,
            agent_ids: outcome.session.agent_ids,
        });
        Ok(active)
    }

    /// Validate `action` against the current status. Returns the session id
    /// to send the request for.
    pub fn begin_action(&mut self, action: SessionAction) -> Result<String> {
        self.ensure_idle()?;
        let active = self.active.as_ref().ok_or(FleetError::NoActiveSession)?;
        active.status.transition(action)?;
        self.in_flight = Some(InFlight::Action(action));
        Ok(active.id.clone())
    }

    /// Apply a confirmed action. A confirmation for a session that is no
    /// longer current is ignored.
    pub fn complete_action(
        &mut self,
        action: SessionAction,
        session_id: &str,
        result: Result<()>,
    ) -> Result<Option<SessionStatus>> {
        if self.in_flight == Some(InFlight::Action(action)) {
            self.in_flight = None;
        }
        result.inspect_err(|e| warn!(%action, session_id, %e, "Session request failed"))?;
        let Some(active) = self.active.as_mut().filter(|a| a.id == session_id) else {
            return Ok(None);
        };
        active.status = active.status.transition(action)?;
        info!(session_id, status = %active.status, "Session status confirmed");
        Ok(Some(active.status))
    }

    /// Session id for a one-batch request. Status is not touched.
    pub fn one_batch_target(&self) -> Result<String> {
        self.active
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or(FleetError::NoActiveSession)
    }

    /// Drop the local session if its project went away.
    pub fn forget_project(&mut self, project_id: &str) -> bool {
        if self.active.as_ref().is_some_and(|a| a.project_id == project_id) {
            self.active = None;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.active = None;
    }
}
