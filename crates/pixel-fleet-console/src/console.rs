//! The console event loop.
//!
//! One task owns the [`ConsoleContext`]. It selects over link events,
//! operator commands, finished coordinator requests and its own timers,
//! running each handler to completion before the next. Requests run as
//! futures polled by the same loop, so several can be outstanding while
//! inbound events keep flowing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use pixel_fleet_core::client_state::ClientStateStore;
use pixel_fleet_core::config::Config;
use pixel_fleet_core::error::{FleetError, Result};
use pixel_fleet_core::types::SessionAction;
use pixel_fleet_preview::{Layer, RefreshTicket};

use crate::controller::{StartOutcome, StartPlan, StartRequest, run_start_sequence};
use crate::coordinator::{BatchOutcome, Coordinator, FavoriteOutcome, GuardPreview};
use crate::events::{ConsoleEvent, publish};
use crate::link::{Link, LinkEvent, LinkHandle};
use crate::router;
use crate::state::ConsoleContext;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Keepalive sent on the UI socket; the coordinator ignores its content.
fn ping_frame() -> Value {
    json!({"type": "ping", "timestamp": chrono::Utc::now().timestamp_millis()})
}
const EVENT_CAPACITY: usize = 256;

pub type Reply = oneshot::Sender<Result<Value>>;

#[derive(Debug)]
pub enum CommandKind {
    /// Start a new session. Empty `agent_ids` means the current selection.
    Start(StartRequest),
    Pause,
    Resume,
    Stop,
    OneBatch,
    Select(Vec<String>),
    Favorite(String),
    /// Merge into the pending guard config; saved after the debounce window.
    EditGuardConfig(Value),
    RefreshPreview,
    SetLayer(Layer, bool),
    /// Current state as JSON.
    Snapshot,
    Shutdown,
}

#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub reply: Option<Reply>,
}

/// Cloneable front door to a running console.
#[derive(Clone)]
pub struct ConsoleHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConsoleEvent>,
}

impl ConsoleHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    /// Send a command and wait for its result.
    pub async fn request(&self, kind: CommandKind) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command { kind, reply: Some(tx) })
            .map_err(|_| FleetError::Link("console stopped".into()))?;
        rx.await
            .map_err(|_| FleetError::Link("console dropped the request".into()))?
    }

    /// Fire and forget.
    pub fn notify(&self, kind: CommandKind) {
        if self.commands.send(Command { kind, reply: None }).is_err() {
            debug!("Console stopped, command dropped");
        }
    }

    pub async fn start(&self, request: StartRequest) -> Result<Value> {
        self.request(CommandKind::Start(request)).await
    }

    pub async fn pause(&self) -> Result<Value> {
        self.request(CommandKind::Pause).await
    }

    pub async fn resume(&self) -> Result<Value> {
        self.request(CommandKind::Resume).await
    }

    pub async fn stop(&self) -> Result<Value> {
        self.request(CommandKind::Stop).await
    }

    pub async fn one_batch(&self) -> Result<Value> {
        self.request(CommandKind::OneBatch).await
    }

    pub async fn select(&self, agent_ids: Vec<String>) -> Result<Value> {
        self.request(CommandKind::Select(agent_ids)).await
    }

    pub async fn favorite(&self, agent_id: impl Into<String>) -> Result<Value> {
        self.request(CommandKind::Favorite(agent_id.into())).await
    }

    pub async fn edit_guard_config(&self, patch: Value) -> Result<Value> {
        self.request(CommandKind::EditGuardConfig(patch)).await
    }

    pub async fn refresh_preview(&self) -> Result<Value> {
        self.request(CommandKind::RefreshPreview).await
    }

    pub async fn snapshot(&self) -> Result<Value> {
        self.request(CommandKind::Snapshot).await
    }

    pub async fn shutdown(&self) -> Result<Value> {
        self.request(CommandKind::Shutdown).await
    }
}

enum Completion {
    Start {
        result: Result<StartOutcome>,
        reply: Option<Reply>,
    },
    Action {
        action: SessionAction,
        session_id: String,
        result: Result<()>,
        reply: Option<Reply>,
    },
    Batch {
        result: Result<BatchOutcome>,
        reply: Option<Reply>,
    },
    Selection {
        result: Result<Vec<String>>,
        reply: Option<Reply>,
    },
    Favorite {
        result: Result<FavoriteOutcome>,
        reply: Option<Reply>,
    },
    GuardSaved {
        result: Result<Value>,
        replies: Vec<Reply>,
    },
    Preview {
        ticket: RefreshTicket,
        result: Result<GuardPreview>,
        reply: Option<Reply>,
    },
}

pub struct Console {
    ctx: ConsoleContext,
    coordinator: Arc<dyn Coordinator>,
    link: LinkHandle,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ConsoleEvent>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    /// Bumped on every connect; a deferred refresh from an older
    /// connection is dropped.
    epoch: u64,
    preview_refresh_at: Option<(TokioInstant, u64)>,
    guard_save_at: Option<TokioInstant>,
    guard_patch: Map<String, Value>,
    guard_replies: Vec<Reply>,
}

fn reply(to: Option<Reply>, result: Result<Value>) {
    if let Some(tx) = to {
        let _ = tx.send(result);
    }
}

async fn wait_until(deadline: Option<TokioInstant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Console {
    /// Build the console and start its link. Must be called inside a runtime.
    pub fn new(
        config: Arc<Config>,
        coordinator: Arc<dyn Coordinator>,
        client_state: ClientStateStore,
    ) -> (Self, ConsoleHandle) {
        let (link_tx, link_events) = mpsc::unbounded_channel();
        let link = Link::spawn(config.ws_url(), &config.link(), link_tx);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = ConsoleHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let console = Self {
            ctx: ConsoleContext::new(config, client_state),
            coordinator,
            link,
            link_events,
            commands,
            events,
            in_flight: FuturesUnordered::new(),
            epoch: 0,
            preview_refresh_at: None,
            guard_save_at: None,
            guard_patch: Map::new(),
            guard_replies: Vec::new(),
        };
        (console, handle)
    }

    pub async fn run(mut self) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;
        info!(url = %self.ctx.config.ws_url(), "Console running");

        loop {
            tokio::select! {
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                cmd = self.commands.recv() => match cmd {
                    Some(Command { kind: CommandKind::Shutdown, reply: to }) => {
                        reply(to, Ok(json!({"ok": true})));
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(done) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_completion(done);
                }
                _ = wait_until(self.preview_refresh_at.map(|(at, _)| at)) => self.on_preview_timer(),
                _ = wait_until(self.guard_save_at) => self.flush_guard_config(),
                _ = keepalive.tick() => {
                    if self.link.is_open() {
                        self.link.send(&ping_frame());
                    }
                }
            }
        }

        self.link.close();
        info!("Console stopped");
    }

    fn emit(&self, event: ConsoleEvent) {
        publish(&self.events, event);
    }

    fn emit_all(&self, events: Vec<ConsoleEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn replan(&mut self) {
        let plan = self.ctx.replan().clone();
        self.emit(ConsoleEvent::PlanUpdated(plan));
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { conn_id } => {
                self.epoch += 1;
                let delay = Duration::from_millis(self.ctx.config.link().preview_refresh_delay_ms);
                self.preview_refresh_at = Some((TokioInstant::now() + delay, self.epoch));
                let url = self.ctx.config.coordinator_url();
                if let Err(e) = self.ctx.client_state.update(|s| s.coordinator_url = Some(url)) {
                    warn!(%e, "Failed to persist coordinator address");
                }
                self.emit(ConsoleEvent::LinkUp { conn_id });
            }
            LinkEvent::Message(frame) => {
                let events = router::dispatch(&mut self.ctx, frame, Instant::now());
                self.emit_all(events);
            }
            LinkEvent::Disconnected { reason } => {
                self.preview_refresh_at = None;
                self.emit(ConsoleEvent::LinkDown { reason });
            }
            LinkEvent::Reconnecting { attempt, delay } => self.emit(ConsoleEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            }),
            LinkEvent::GaveUp { attempts } => {
                warn!(attempts, "Coordinator unreachable; restart the console to retry");
                self.emit(ConsoleEvent::LinkLost { attempts });
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        let Command { kind, reply: to } = cmd;
        let coordinator = self.coordinator.clone();
        match kind {
            CommandKind::Start(mut request) => {
                if request.agent_ids.is_empty() {
                    request.agent_ids = self.ctx.controller.selection().to_vec();
                }
                match self.ctx.controller.begin_start(&request) {
                    Ok(StartPlan::New) => {}
                    Ok(StartPlan::Existing(session_id)) => {
                        info!(%session_id, "Starting the coordinator's created session");
                        self.in_flight.push(Box::pin(async move {
                            let result = coordinator.start_session(&session_id).await;
                            Completion::Action {
                                action: SessionAction::Start,
                                session_id,
                                result,
                                reply: to,
                            }
                        }));
                        return;
                    }
                    Err(e) => return reply(to, Err(e)),
                }
                info!(name = %request.name, mode = %request.mode, agents = request.agent_ids.len(), "Starting session");
                self.in_flight.push(Box::pin(async move {
                    let result = run_start_sequence(coordinator.as_ref(), request).await;
                    Completion::Start { result, reply: to }
                }));
            }
            CommandKind::Pause | CommandKind::Resume | CommandKind::Stop => {
                let action = match kind {
                    CommandKind::Pause => SessionAction::Pause,
                    CommandKind::Resume => SessionAction::Resume,
                    _ => SessionAction::Stop,
                };
                let session_id = match self.ctx.controller.begin_action(action) {
                    Ok(id) => id,
                    Err(e) => return reply(to, Err(e)),
                };
                self.in_flight.push(Box::pin(async move {
                    let result = match action {
                        SessionAction::Pause => coordinator.pause_session(&session_id).await,
                        SessionAction::Stop => coordinator.stop_session(&session_id).await,
                        // the coordinator resumes a paused session through start
                        SessionAction::Resume | SessionAction::Start => {
                            coordinator.start_session(&session_id).await
                        }
                    };
                    Completion::Action { action, session_id, result, reply: to }
                }));
            }
            CommandKind::OneBatch => {
                let session_id = match self.ctx.controller.one_batch_target() {
                    Ok(id) => id,
                    Err(e) => return reply(to, Err(e)),
                };
                self.in_flight.push(Box::pin(async move {
                    let result = coordinator.one_batch(&session_id).await;
                    Completion::Batch { result, reply: to }
                }));
            }
            CommandKind::Select(agent_ids) => {
                self.ctx.select(agent_ids.clone());
                self.emit(ConsoleEvent::SelectionChanged { agent_ids: agent_ids.clone() });
                self.replan();
                self.in_flight.push(Box::pin(async move {
                    let result = coordinator.update_selection(&agent_ids).await;
                    Completion::Selection { result, reply: to }
                }));
            }
            CommandKind::Favorite(agent_id) => {
                self.in_flight.push(Box::pin(async move {
                    let result = coordinator.set_favorite(&agent_id).await;
                    Completion::Favorite { result, reply: to }
                }));
            }
            CommandKind::EditGuardConfig(patch) => {
                let Value::Object(fields) = patch else {
                    return reply(to, Err(FleetError::Request("guard config patch must be an object".into())));
                };
                if !self.ctx.guard_config.is_object() {
                    self.ctx.guard_config = Value::Object(Map::new());
                }
                for (k, v) in fields {
                    if let Some(local) = self.ctx.guard_config.as_object_mut() {
                        local.insert(k.clone(), v.clone());
                    }
                    self.guard_patch.insert(k, v);
                }
                if let Some(tx) = to {
                    self.guard_replies.push(tx);
                }
                let debounce = Duration::from_millis(self.ctx.config.guard().save_debounce_ms);
                self.guard_save_at = Some(TokioInstant::now() + debounce);
                self.replan();
            }
            CommandKind::RefreshPreview => self.begin_preview_fetch(to),
            CommandKind::SetLayer(layer, on) => {
                self.ctx.preview.set_layer(layer, on);
                reply(to, Ok(json!(self.ctx.preview.layers())));
            }
            CommandKind::Snapshot => reply(to, Ok(self.snapshot())),
            CommandKind::Shutdown => reply(to, Ok(json!({"ok": true}))),
        }
    }

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Start { result, reply: to } => {
                let result = match self.ctx.controller.complete_start(result) {
                    Ok(active) => Ok(active.clone()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(active) => {
                        self.ctx.preview.set_mode_hint(self.ctx.controller.mode());
                        self.ctx.persist_selection();
                        self.emit(ConsoleEvent::SessionChanged {
                            session_id: active.id.clone(),
                            status: active.status,
                        });
                        self.emit(ConsoleEvent::SelectionChanged { agent_ids: active.agent_ids.clone() });
                        self.replan();
                        reply(to, Ok(json!(active)));
                    }
                    Err(e) => self.fail("start", e, to),
                }
            }
            Completion::Action { action, session_id, result, reply: to } => {
                match self.ctx.controller.complete_action(action, &session_id, result) {
                    Ok(Some(status)) => {
                        self.emit(ConsoleEvent::SessionChanged { session_id: session_id.clone(), status });
                        reply(to, Ok(json!({"session_id": session_id, "status": status})));
                    }
                    Ok(None) => reply(to, Ok(json!({"session_id": session_id, "superseded": true}))),
                    Err(e) => self.fail(&action.to_string(), e, to),
                }
            }
            Completion::Batch { result, reply: to } => match result {
                Ok(outcome) => {
                    info!(assigned = outcome.assigned, reason = outcome.reason.as_deref().unwrap_or("-"), "One batch sent");
                    reply(to, Ok(json!(outcome)));
                }
                Err(e) => self.fail("one_batch", e, to),
            },
            Completion::Selection { result, reply: to } => match result {
                Ok(agent_ids) => reply(to, Ok(json!({"slave_ids": agent_ids}))),
                Err(e) => self.fail("select", e, to),
            },
            Completion::Favorite { result, reply: to } => match result {
                Ok(outcome) => {
                    if self.ctx.registry.set_favorite(&outcome.favorite).is_ok() {
                        self.emit(ConsoleEvent::FavoriteChanged { agent_id: outcome.favorite.clone() });
                    }
                    reply(to, Ok(json!(outcome)));
                }
                Err(e) => self.fail("favorite", e, to),
            },
            Completion::GuardSaved { result, replies } => match result {
                Ok(changed) => {
                    self.emit(ConsoleEvent::GuardConfig { config: self.ctx.guard_config.clone() });
                    for tx in replies {
                        let _ = tx.send(Ok(json!({"changed": changed})));
                    }
                }
                Err(e) => {
                    self.emit(ConsoleEvent::RequestFailed {
                        operation: "guard_config".into(),
                        error: e.to_string(),
                    });
                    for tx in replies {
                        let _ = tx.send(Err(FleetError::Request(e.to_string())));
                    }
                }
            },
            Completion::Preview { ticket, result, reply: to } => match result {
                Ok(preview) => {
                    match self.ctx.preview.ingest_fetched(ticket, &preview.data, Instant::now()) {
                        Some(stats) => {
                            self.emit(ConsoleEvent::PreviewUpdated(stats));
                            reply(to, Ok(json!({"refreshed": true, "stats": stats})));
                        }
                        None => reply(to, Ok(json!({"refreshed": false, "stale": true}))),
                    }
                }
                Err(e) => self.fail("preview", e, to),
            },
        }
    }

    fn fail(&self, operation: &str, error: FleetError, to: Option<Reply>) {
        warn!(operation, %error, "Coordinator request failed");
        self.emit(ConsoleEvent::RequestFailed {
            operation: operation.to_string(),
            error: error.to_string(),
        });
        reply(to, Err(error));
    }

    fn flush_guard_config(&mut self) {
        self.guard_save_at = None;
        if self.guard_patch.is_empty() {
            return;
        }
        let patch = Value::Object(std::mem::take(&mut self.guard_patch));
        let replies = std::mem::take(&mut self.guard_replies);
        let coordinator = self.coordinator.clone();
        debug!(fields = patch.as_object().map_or(0, Map::len), "Saving guard config");
        self.in_flight.push(Box::pin(async move {
            let result = coordinator.save_guard_config(&patch).await;
            Completion::GuardSaved { result, replies }
        }));
    }

    fn on_preview_timer(&mut self) {
        let Some((_, epoch)) = self.preview_refresh_at.take() else {
            return;
        };
        if epoch != self.epoch || !self.link.is_open() {
            debug!("Skipping deferred preview refresh from an old connection");
            return;
        }
        self.begin_preview_fetch(None);
    }

    fn begin_preview_fetch(&mut self, to: Option<Reply>) {
        let now = Instant::now();
        let Some(ticket) = self.ctx.preview.begin_refresh(now) else {
            let wait = self.ctx.preview.refresh_remaining(now);
            if to.is_none() {
                // timer-driven: try again once the cooldown is over
                self.preview_refresh_at = Some((TokioInstant::now() + wait, self.epoch));
            }
            return reply(to, Ok(json!({"refreshed": false, "retry_in_ms": wait.as_millis() as u64})));
        };
        let coordinator = self.coordinator.clone();
        self.in_flight.push(Box::pin(async move {
            let result = coordinator.guard_preview().await;
            Completion::Preview { ticket, result, reply: to }
        }));
    }

    fn snapshot(&mut self) -> Value {
        let now = Instant::now();
        json!({
            "link_open": self.link.is_open(),
            "agents": self.ctx.registry.agents().collect::<Vec<_>>(),
            "aggregates": self.ctx.registry.aggregates(),
            "selection": self.ctx.controller.selection(),
            "session": self.ctx.controller.active(),
            "mode": self.ctx.controller.mode(),
            "plan": &self.ctx.plan,
            "projects": &self.ctx.projects,
            "guard_config": &self.ctx.guard_config,
            "preview": self.ctx.preview.stats().map(|s| json!({
                "original": s.original,
                "correct": s.correct,
                "incorrect": s.incorrect,
                "missing": s.missing,
                "accuracy": s.accuracy(),
            })),
            "recent_repairs": self.ctx.preview.recent_repair_count(now),
            "layers": self.ctx.preview.layers(),
        })
    }
}
