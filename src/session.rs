//! Session lifecycle and the controller that glues the core together.
//!
//! [`SessionController`] owns the transport, the replica, the timeline, the
//! command gate and the run-till-end controller for exactly one active
//! session. All local mutation happens on the task that calls its methods;
//! inbound traffic is pulled with [`SessionController::next_inbound`] and
//! applied with [`SessionController::handle_inbound`], one item at a time.
//!
//! Gate-occupying commands ([`UserCommand`]) go through [`Self::submit`].
//! Interrupts (stop, pause, resume, skip, continue, cancel, hints) bypass the
//! queue.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{CreateSession, HttpSessionApi, SessionApi};
use crate::config::{Config, SessionDefaults};
use crate::connection::ConnectionMode;
use crate::error::{ClientError, CommandError};
use crate::gate::{Admission, BusyKind, CommandGate, Completion, GateState, QueuedCommand, UserCommand};
use crate::merger::{MergeOutcome, SessionReplica};
use crate::protocol::{ClientCommand, ServerEvent, SessionRecord, SessionStatus};
use crate::run_till_end::{RunPhase, RunTillEnd, RunTillEndState, RunUpdate};
use crate::session_cell::SessionCell;
use crate::timeline::{Timeline, TimelineEntry};
use crate::transport::{Inbound, SessionTransport, Transport};
use crate::undo::{self, UndoOutcome};

/// Result of [`SessionController::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Dispatched,
    Queued { id: uuid::Uuid, position: usize },
    /// Forwarded as a hint to the running execution.
    Injected,
}

/// Connection summary for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub mode: ConnectionMode,
    pub reconnect_attempt: u32,
    pub watermark: usize,
}

pub struct SessionController {
    api: Arc<dyn SessionApi>,
    transport: Box<dyn SessionTransport>,
    cell: SessionCell,
    defaults: SessionDefaults,
    replica: SessionReplica,
    timeline: Timeline,
    gate: CommandGate,
    run: RunTillEnd,
    inbound: Option<mpsc::Receiver<Inbound>>,
    last_undo: Option<UndoOutcome>,
}

impl SessionController {
    /// `transport` must read the session id from `cell`.
    pub fn new(
        api: Arc<dyn SessionApi>,
        transport: Box<dyn SessionTransport>,
        cell: SessionCell,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            api,
            transport,
            cell,
            defaults,
            replica: SessionReplica::default(),
            timeline: Timeline::default(),
            gate: CommandGate::new(),
            run: RunTillEnd::new(),
            inbound: None,
            last_undo: None,
        }
    }

    /// HTTP collaborator plus the dual-mode transport, both from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let api: Arc<dyn SessionApi> = Arc::new(HttpSessionApi::from_config(config)?);
        let cell = SessionCell::new();
        let transport = Transport::new(
            Arc::clone(&api),
            &config.server.base_url,
            config.server.api_key.clone(),
            config.transport.clone(),
            cell.reader(),
        );
        Ok(Self::new(
            api,
            Box::new(transport),
            cell,
            config.session.clone(),
        ))
    }

    pub fn session_id(&self) -> Option<String> {
        self.cell.current()
    }

    pub fn replica(&self) -> &SessionReplica {
        &self.replica
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    pub fn run_phase(&self) -> RunPhase {
        self.run.phase()
    }

    pub fn run_state(&self) -> &RunTillEndState {
        self.run.state()
    }

    pub fn last_undo(&self) -> Option<&UndoOutcome> {
        self.last_undo.as_ref()
    }

    pub fn connection(&self) -> Connection {
        let state = self.transport.state();
        Connection {
            mode: state.mode,
            reconnect_attempt: state.reconnect_attempt,
            watermark: self.replica.watermark(),
        }
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Attach to an existing session, discarding local state for any other.
    pub async fn attach(&mut self, session_id: &str) -> Result<(), CommandError> {
        if self.session_id().as_deref() != Some(session_id) {
            self.timeline.clear();
        }
        self.gate.reset();
        self.run.reset();
        self.bind(session_id).await
    }

    /// Stop every timer and forget the session.
    pub async fn detach(&mut self) {
        self.cell.set(None);
        self.transport.detach().await;
        self.inbound = None;
        self.gate.reset();
        self.run.reset();
        info!("Session: detached");
    }

    /// Make `session_id` active and (re)attach the transport to it.
    async fn bind(&mut self, session_id: &str) -> Result<(), CommandError> {
        self.cell.set(Some(session_id.to_string()));
        if self.replica.session_id.as_deref() != Some(session_id) {
            self.replica = SessionReplica::new(session_id);
        }
        self.inbound = Some(self.transport.attach(session_id).await?);
        info!("Session: attached to {session_id}");
        Ok(())
    }

    /// Return the session to a blank slate.
    ///
    /// When the server keeps the same id the cell generation still advances,
    /// so timers scheduled for the pre-reset session die.
    pub async fn reset(&mut self) -> Result<(), CommandError> {
        let id = self.require_session()?;
        let record = self.api.reset_session(&id).await?;
        self.gate.reset();
        self.run.reset();
        self.timeline.clear();
        self.replica.clear();
        if record.id == id {
            debug!("Session: reset kept id {id}");
        } else {
            info!("Session: reset moved {id} -> {}", record.id);
            self.replica = SessionReplica::new(&record.id);
        }
        self.bind(&record.id).await?;
        self.replica.apply_record(&record);
        self.timeline
            .push(TimelineEntry::System("Session reset".into()));
        Ok(())
    }

    // ── gate-occupying commands ──────────────────────────────────────

    pub async fn submit(&mut self, command: UserCommand) -> Result<Submitted, CommandError> {
        match self.gate.submit(command) {
            Admission::Dispatch(queued) => {
                self.run_admitted(queued).await?;
                Ok(Submitted::Dispatched)
            }
            Admission::Queued { id, position } => {
                let label = self
                    .gate
                    .queued()
                    .find(|q| q.id == id)
                    .map(|q| q.payload.label())
                    .unwrap_or_default();
                self.timeline.push(TimelineEntry::Waiting(format!(
                    "Queued at position {position}: {label}"
                )));
                Ok(Submitted::Queued { id, position })
            }
            Admission::Inject(text) => {
                self.hint(&text).await?;
                Ok(Submitted::Injected)
            }
        }
    }

    /// Execute `first` and keep draining while commands complete synchronously.
    /// Returns the result of `first` only; later failures land on the timeline.
    async fn run_admitted(&mut self, first: QueuedCommand) -> Result<(), CommandError> {
        let mut result = Ok(());
        let mut is_first = true;
        let mut next = Some(first);
        while let Some(command) = next.take() {
            debug!(id = %command.id, "Session: executing '{}'", command.payload.label());
            let completion = match self.execute(command.payload).await {
                Ok(completion) => completion,
                Err(e) => {
                    warn!("Session: command failed: {e}");
                    self.timeline.push(TimelineEntry::Error(e.to_string()));
                    if is_first {
                        result = Err(e);
                    }
                    Some(Completion::Failed)
                }
            };
            is_first = false;
            if let Some(completion) = completion {
                next = self.gate.complete(completion);
            }
        }
        result
    }

    /// Start a command. `Ok(None)` means completion arrives later as an event.
    async fn execute(&mut self, command: UserCommand) -> Result<Option<Completion>, CommandError> {
        match command {
            UserCommand::Instruct(text) => self.instruct(text).await,
            UserCommand::Start => {
                let id = self.require_session()?;
                match self.replica.status {
                    SessionStatus::PlanReady => self.api.approve_plan(&id).await?,
                    SessionStatus::Approved => {}
                    other => {
                        return Err(CommandError::InvalidState {
                            action: "start",
                            state: other.as_str(),
                        })
                    }
                }
                self.send(self.start_command()).await?;
                self.replica.apply_status_change(SessionStatus::Queued);
                self.timeline
                    .push(TimelineEntry::System("Execution started".into()));
                Ok(None)
            }
            UserCommand::RunTillEnd => {
                self.require_session()?;
                let command = self.run.start()?;
                self.send(command).await?;
                self.run.commit_start();
                self.timeline
                    .push(TimelineEntry::System("Running till end".into()));
                Ok(None)
            }
            UserCommand::Undo(target) => self.perform_undo(target).await.map(Some),
        }
    }

    async fn instruct(&mut self, text: String) -> Result<Option<Completion>, CommandError> {
        self.timeline.push(TimelineEntry::User(text.clone()));
        let record = match self.session_id() {
            Some(id) => self.api.continue_session(&id, &text).await?,
            None => {
                let request = CreateSession {
                    instruction: text,
                    headless: self.defaults.headless,
                    model: self.defaults.model.clone(),
                };
                let record = self.api.create_session(&request).await?;
                info!("Session: created {}", record.id);
                self.bind(&record.id).await?;
                record
            }
        };
        self.replica.apply_record(&record);
        match record.status {
            SessionStatus::PlanReady => {
                self.load_plan(&record).await;
                Ok(Some(Completion::Succeeded))
            }
            SessionStatus::Failed => Err(CommandError::Rejected("plan generation failed".into())),
            _ => {
                self.timeline
                    .push(TimelineEntry::Waiting("Generating plan".into()));
                Ok(None)
            }
        }
    }

    async fn perform_undo(&mut self, target: u32) -> Result<Completion, CommandError> {
        let id = self.require_session()?;
        let outcome = undo::undo_to_step(self.api.as_ref(), &mut self.replica, &id, target).await;
        let message = outcome.user_message(target);
        self.last_undo = Some(outcome.clone());
        match outcome {
            UndoOutcome::Full { .. } => {
                self.timeline.push(TimelineEntry::System(message));
                Ok(Completion::Succeeded)
            }
            UndoOutcome::Partial { .. } => {
                self.timeline.push(TimelineEntry::Error(message));
                Ok(Completion::Failed)
            }
            UndoOutcome::Failed { .. } => Err(CommandError::Rejected(message)),
        }
    }

    /// Complete the outstanding command and run whatever is queued next.
    async fn complete_gate(&mut self, completion: Completion) {
        if let Some(next) = self.gate.complete(completion) {
            // Failures are already on the timeline.
            let _ = self.run_admitted(next).await;
        }
    }

    pub async fn resolve_failure_by_discarding(&mut self) -> usize {
        let discarded = self.gate.resolve_failure_by_discarding();
        if !discarded.is_empty() {
            self.timeline.push(TimelineEntry::System(format!(
                "Discarded {} queued command(s)",
                discarded.len()
            )));
        }
        discarded.len()
    }

    pub async fn resolve_failure_by_continuing(&mut self) -> Result<(), CommandError> {
        match self.gate.resolve_failure_by_continuing() {
            Some(next) => self.run_admitted(next).await,
            None => Ok(()),
        }
    }

    // ── interrupts ───────────────────────────────────────────────────

    pub async fn stop(&mut self) -> Result<(), CommandError> {
        let id = self.require_session()?;
        self.api.stop_session(&id).await?;
        self.run.reset();
        self.timeline
            .push(TimelineEntry::System("Stop requested".into()));
        self.apply_status(SessionStatus::Stopped).await;
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), CommandError> {
        self.require_session()?;
        self.send(ClientCommand::PauseExecution).await
    }

    /// Resume a paused session.
    pub async fn resume(&mut self) -> Result<(), CommandError> {
        self.require_session()?;
        if self.replica.status != SessionStatus::Paused {
            return Err(CommandError::InvalidState {
                action: "resume",
                state: self.replica.status.as_str(),
            });
        }
        self.send(self.start_command()).await?;
        if !self.gate.acquire(BusyKind::Executing) {
            self.gate.rebind(BusyKind::Executing);
        }
        self.replica.apply_status_change(SessionStatus::Queued);
        self.timeline
            .push(TimelineEntry::System("Execution resumed".into()));
        Ok(())
    }

    /// Forward guidance to the running execution.
    pub async fn hint(&mut self, text: &str) -> Result<(), CommandError> {
        self.require_session()?;
        self.send(ClientCommand::InjectCommand {
            text: text.to_string(),
        })
        .await?;
        self.timeline.push(TimelineEntry::User(text.to_string()));
        Ok(())
    }

    /// Skip the failed step and continue. On a send failure the run stays
    /// paused and the call can be repeated.
    pub async fn skip_failed_step(&mut self) -> Result<(), CommandError> {
        let (step_number, commands) = self.run.skip()?;
        for command in commands {
            let is_skip = matches!(command, ClientCommand::SkipStep { .. });
            self.send_run_command(command).await?;
            if is_skip {
                self.run.mark_skip_sent();
            }
        }
        self.run.commit_skip(step_number);
        Ok(())
    }

    pub async fn continue_run(&mut self) -> Result<(), CommandError> {
        let command = self.run.continue_run()?;
        self.send_run_command(command).await?;
        self.run.commit_continue();
        Ok(())
    }

    /// Cancel the run. It completes locally only once the server was told.
    pub async fn cancel_run(&mut self) -> Result<(), CommandError> {
        let command = self.run.cancel()?;
        self.send_run_command(command).await?;
        let summary = self.run.commit_cancel();
        self.timeline.push(TimelineEntry::System(format!(
            "Run cancelled after {} step(s)",
            summary.completed_steps
        )));
        self.complete_gate(Completion::Succeeded).await;
        Ok(())
    }

    /// Leave a paused run and rewind to `target`.
    pub async fn undo_from_pause(&mut self, target: u32) -> Result<(), CommandError> {
        self.run.exit_for_undo()?;
        if !self.gate.acquire(BusyKind::Undoing) {
            self.gate.rebind(BusyKind::Undoing);
        }
        match self.perform_undo(target).await {
            Ok(completion) => {
                self.complete_gate(completion).await;
                Ok(())
            }
            Err(e) => {
                self.timeline.push(TimelineEntry::Error(e.to_string()));
                self.complete_gate(Completion::Failed).await;
                Err(e)
            }
        }
    }

    // ── history edits ────────────────────────────────────────────────

    pub async fn delete_step(&mut self, step_number: u32) -> Result<(), CommandError> {
        let id = self.require_idle("delete step")?;
        let count = undo::delete_step(self.api.as_ref(), &mut self.replica, &id, step_number).await?;
        self.timeline.push(TimelineEntry::System(format!(
            "Deleted step {step_number} ({count} steps remain)"
        )));
        Ok(())
    }

    pub async fn set_action_enabled(
        &mut self,
        step_number: u32,
        action_index: usize,
        enabled: bool,
    ) -> Result<(), CommandError> {
        let id = self.require_idle("edit action")?;
        self.api
            .set_action_enabled(&id, step_number, action_index, enabled)
            .await?;
        undo::refresh_steps(self.api.as_ref(), &mut self.replica, &id).await?;
        Ok(())
    }

    // ── inbound ──────────────────────────────────────────────────────

    /// Next item from the transport. Pends forever while detached; returns
    /// `None` once when the transport side ends.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        let item = match self.inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        };
        if item.is_none() {
            debug!("Session: transport stream ended");
            self.inbound = None;
        }
        item
    }

    pub async fn handle_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::Event(event) => self.handle_event(event).await,
            Inbound::Snapshot(snapshot) => {
                if snapshot.session.id.is_empty()
                    || self.session_id().as_deref() != Some(snapshot.session.id.as_str())
                {
                    debug!("Session: ignoring snapshot for another session");
                    return;
                }
                let (merged, changed) = self.replica.apply_snapshot(&snapshot);
                self.record_steps(merged);
                if changed.is_some() {
                    self.on_status_change(self.replica.status).await;
                }
            }
            Inbound::ModeChanged(mode) => {
                info!("Session: connection mode {mode}");
            }
        }
    }

    pub async fn handle_event(&mut self, event: ServerEvent) {
        if let Some(update) = self.run.on_event(&event) {
            self.on_run_update(update).await;
        }

        match event {
            ServerEvent::InitialState { session, steps } => {
                let previous = self.replica.status;
                let merged = self.replica.apply_initial_state(&session, &steps);
                self.record_steps(merged);
                if previous != self.replica.status {
                    self.on_status_change(self.replica.status).await;
                }
            }
            ServerEvent::StepCompleted { step } => {
                let merged = self.replica.apply_step_event(&step);
                if merged.gap.is_some() {
                    self.resync_after_gap().await;
                } else {
                    self.record_steps(merged);
                }
            }
            ServerEvent::StatusChanged { status } => self.apply_status(status).await,
            ServerEvent::Completed {
                status,
                success,
                message,
            } => {
                if let Some(message) = message {
                    self.timeline.push(TimelineEntry::Assistant(message));
                }
                let status = status.unwrap_or(if success == Some(false) {
                    SessionStatus::Failed
                } else {
                    SessionStatus::Completed
                });
                self.apply_status(status).await;
            }
            ServerEvent::Error { message } => {
                warn!("Session: server error: {message}");
                self.timeline.push(TimelineEntry::Error(message));
                if self.gate.state().is_busy() && !self.run.is_active() {
                    self.complete_gate(Completion::Failed).await;
                }
            }
            ServerEvent::ExecutionPaused {
                step_number,
                message,
            } => {
                let text = match (step_number, message) {
                    (Some(n), Some(m)) => format!("Paused at step {n}: {m}"),
                    (Some(n), None) => format!("Paused at step {n}"),
                    (None, Some(m)) => format!("Paused: {m}"),
                    (None, None) => "Paused".to_string(),
                };
                self.timeline.push(TimelineEntry::System(text));
                self.apply_status(SessionStatus::Paused).await;
            }
            ServerEvent::AllStopped { message } => {
                self.run.reset();
                self.timeline.push(TimelineEntry::System(
                    message.unwrap_or_else(|| "All execution stopped".into()),
                ));
                self.apply_status(SessionStatus::Stopped).await;
            }
            ServerEvent::Pong
            | ServerEvent::RunTillEndStarted { .. }
            | ServerEvent::RunTillEndProgress { .. }
            | ServerEvent::RunTillEndPaused { .. }
            | ServerEvent::RunTillEndCompleted { .. }
            | ServerEvent::StepSkipped { .. }
            | ServerEvent::Unknown => {}
        }
    }

    async fn on_run_update(&mut self, update: RunUpdate) {
        match update {
            RunUpdate::Started { total_steps } => {
                self.timeline.push(TimelineEntry::System(format!(
                    "Run till end started ({total_steps} steps)"
                )));
            }
            RunUpdate::Progress { .. } => {}
            RunUpdate::Paused { step_number, error } => {
                self.timeline.push(TimelineEntry::Error(format!(
                    "Step {step_number} failed: {error}"
                )));
                self.timeline.push(TimelineEntry::Waiting(
                    "Skip, continue, undo or cancel".into(),
                ));
            }
            RunUpdate::StepSkipped(n) => {
                self.timeline
                    .push(TimelineEntry::System(format!("Skipped step {n}")));
            }
            RunUpdate::Completed(summary) => {
                self.timeline.push(TimelineEntry::System(format!(
                    "Run till end finished: {} completed, {} skipped, success={}",
                    summary.completed_steps,
                    summary.skipped_steps.len(),
                    summary.success
                )));
                let completion = if summary.success {
                    Completion::Succeeded
                } else {
                    Completion::Failed
                };
                self.complete_gate(completion).await;
            }
            RunUpdate::FinalTally(summary) => {
                debug!(
                    completed = summary.completed_steps,
                    "Session: final tally after cancel"
                );
            }
        }
    }

    async fn apply_status(&mut self, status: SessionStatus) {
        if self.replica.apply_status_change(status).is_some() {
            self.on_status_change(status).await;
        }
    }

    /// Gate completion driven by status transitions.
    async fn on_status_change(&mut self, status: SessionStatus) {
        debug!("Session: status {status}");
        match self.gate.state() {
            GateState::Busy(BusyKind::Planning) => match status {
                SessionStatus::PlanReady => {
                    let record = SessionRecord {
                        id: self.session_id().unwrap_or_default(),
                        status,
                        headless: self.replica.headless,
                        model: self.replica.model.clone(),
                        plan: self.replica.plan.clone(),
                    };
                    self.load_plan(&record).await;
                    self.complete_gate(Completion::Succeeded).await;
                }
                SessionStatus::Failed | SessionStatus::Stopped | SessionStatus::Cancelled => {
                    self.timeline.push(TimelineEntry::Error(format!(
                        "Plan generation ended: session {status}"
                    )));
                    self.complete_gate(Completion::Failed).await;
                }
                _ => {}
            },
            GateState::Busy(BusyKind::Executing) if !self.run.is_active() && status.is_settled() => {
                self.timeline
                    .push(TimelineEntry::System(format!("Session {status}")));
                let completion = if status == SessionStatus::Failed {
                    Completion::Failed
                } else {
                    Completion::Succeeded
                };
                self.complete_gate(completion).await;
            }
            _ => {}
        }
    }

    /// Use the plan carried by `record`, or fetch it.
    async fn load_plan(&mut self, record: &SessionRecord) {
        let plan = match &record.plan {
            Some(plan) => Some(plan.clone()),
            None => match self.api.get_plan(&record.id).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("Session: plan fetch failed: {e}");
                    self.timeline
                        .push(TimelineEntry::Error(format!("Could not load plan: {e}")));
                    None
                }
            },
        };
        if let Some(plan) = plan {
            self.timeline.push(TimelineEntry::Plan(plan.clone()));
            self.replica.plan = Some(plan);
        }
    }

    async fn resync_after_gap(&mut self) {
        let Some(id) = self.session_id() else {
            return;
        };
        let before = self.replica.watermark();
        match undo::refresh_steps(self.api.as_ref(), &mut self.replica, &id).await {
            Ok(count) => {
                for n in before..count {
                    self.timeline.push(TimelineEntry::Step(n as u32 + 1));
                }
            }
            Err(e) => warn!("Session: re-sync after gap failed: {e}"),
        }
    }

    fn record_steps(&mut self, merged: MergeOutcome) {
        let end = self.replica.watermark();
        for n in end - merged.appended..end {
            self.timeline.push(TimelineEntry::Step(n as u32 + 1));
        }
    }

    /// Send a run-till-end command, recording a failure on the timeline.
    async fn send_run_command(&mut self, command: ClientCommand) -> Result<(), CommandError> {
        let name = command.name();
        if let Err(e) = self.send(command).await {
            warn!("Session: '{name}' not delivered: {e}");
            self.timeline.push(TimelineEntry::Error(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    async fn send(&self, command: ClientCommand) -> Result<(), CommandError> {
        self.transport.send(command).await.map_err(CommandError::from)
    }

    fn start_command(&self) -> ClientCommand {
        ClientCommand::Start {
            headless: Some(self.defaults.headless),
            model: self.defaults.model.clone(),
        }
    }

    fn require_session(&self) -> Result<String, CommandError> {
        self.session_id().ok_or(CommandError::NoSession)
    }

    fn require_idle(&self, action: &'static str) -> Result<String, CommandError> {
        let id = self.require_session()?;
        match self.gate.state() {
            GateState::Idle => Ok(id),
            other => Err(CommandError::InvalidState {
                action,
                state: other.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::{Plan, ReplayStatus, SessionState, UndoResponse};
    use crate::testing::{step, steps, FakeApi, RecordingTransport, TransportProbe};

    fn controller() -> (SessionController, Arc<FakeApi>, TransportProbe) {
        let api = Arc::new(FakeApi::new());
        let (transport, probe) = RecordingTransport::new();
        let ctl = SessionController::new(
            api.clone(),
            Box::new(transport),
            SessionCell::new(),
            SessionDefaults::default(),
        );
        (ctl, api, probe)
    }

    fn plan() -> Plan {
        Plan {
            text: "log in".into(),
            steps: vec!["open page".into(), "submit".into()],
            approved: false,
        }
    }

    async fn status(ctl: &mut SessionController, status: SessionStatus) {
        ctl.handle_event(ServerEvent::StatusChanged { status }).await;
    }

    /// Controller attached to `s1` with the plan ready and the gate idle.
    async fn planned() -> (SessionController, Arc<FakeApi>, TransportProbe) {
        let (mut ctl, api, probe) = controller();
        api.with(|s| s.plan = Some(plan()));
        ctl.submit(UserCommand::Instruct("log in".into()))
            .await
            .unwrap();
        status(&mut ctl, SessionStatus::PlanReady).await;
        assert_eq!(ctl.gate_state(), GateState::Idle);
        (ctl, api, probe)
    }

    /// Run-till-end paused at `step_number`, recorded sends cleared.
    async fn paused_run(step_number: u32) -> (SessionController, Arc<FakeApi>, TransportProbe) {
        let (mut ctl, api, probe) = planned().await;
        ctl.submit(UserCommand::RunTillEnd).await.unwrap();
        ctl.handle_event(ServerEvent::RunTillEndStarted { total_steps: 4 })
            .await;
        ctl.handle_event(ServerEvent::RunTillEndPaused {
            step_number,
            error: "timeout".into(),
        })
        .await;
        assert_eq!(ctl.run_phase(), RunPhase::Paused);
        probe.clear();
        (ctl, api, probe)
    }

    fn not_viable(result: Result<(), CommandError>) -> bool {
        matches!(
            result,
            Err(CommandError::Transport(TransportError::NotViable { .. }))
        )
    }

    #[tokio::test]
    async fn instruction_creates_session_and_waits_for_plan() {
        let (mut ctl, api, probe) = controller();
        api.with(|s| s.plan = Some(plan()));

        let submitted = ctl
            .submit(UserCommand::Instruct("log in".into()))
            .await
            .unwrap();
        assert_eq!(submitted, Submitted::Dispatched);
        assert_eq!(ctl.session_id().as_deref(), Some("s1"));
        assert_eq!(probe.attached(), vec!["s1".to_string()]);
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Planning));

        status(&mut ctl, SessionStatus::PlanReady).await;
        assert_eq!(ctl.gate_state(), GateState::Idle);
        assert_eq!(ctl.replica().plan, Some(plan()));
        assert!(ctl
            .timeline()
            .entries()
            .iter()
            .any(|e| matches!(e, TimelineEntry::Plan(_))));
    }

    #[tokio::test]
    async fn start_queued_behind_planning_runs_when_plan_arrives() {
        let (mut ctl, api, probe) = controller();
        ctl.submit(UserCommand::Instruct("log in".into()))
            .await
            .unwrap();

        let queued = ctl.submit(UserCommand::Start).await.unwrap();
        assert!(matches!(queued, Submitted::Queued { position: 1, .. }));
        assert!(probe.sent().is_empty());

        status(&mut ctl, SessionStatus::PlanReady).await;
        assert!(api.calls().contains(&"approve_plan:s1".to_string()));
        assert_eq!(probe.sent_names(), vec!["start"]);
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Executing));

        status(&mut ctl, SessionStatus::Running).await;
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Executing));
        status(&mut ctl, SessionStatus::Completed).await;
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn instruction_during_execution_is_injected() {
        let (mut ctl, _api, probe) = planned().await;
        ctl.submit(UserCommand::Start).await.unwrap();

        let submitted = ctl
            .submit(UserCommand::Instruct("use the second tab".into()))
            .await
            .unwrap();
        assert_eq!(submitted, Submitted::Injected);
        assert_eq!(
            probe.sent().last(),
            Some(&ClientCommand::InjectCommand {
                text: "use the second tab".into()
            })
        );
        assert_eq!(ctl.gate().queue_len(), 0);
    }

    #[tokio::test]
    async fn server_error_with_queue_waits_for_decision() {
        let (mut ctl, _api, probe) = controller();
        ctl.submit(UserCommand::Instruct("log in".into()))
            .await
            .unwrap();
        ctl.submit(UserCommand::Start).await.unwrap();
        ctl.submit(UserCommand::RunTillEnd).await.unwrap();

        ctl.handle_event(ServerEvent::Error {
            message: "plan generation failed".into(),
        })
        .await;
        assert_eq!(ctl.gate_state(), GateState::FailurePendingDecision);
        assert!(probe.sent().is_empty());
        assert!(ctl.timeline().last().is_some_and(TimelineEntry::is_error));

        assert_eq!(ctl.resolve_failure_by_discarding().await, 2);
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn partial_undo_truncates_and_records_error() {
        let (mut ctl, api, _probe) = planned().await;
        api.with(|s| {
            s.steps = steps(6);
            s.undo = Some(UndoResponse {
                success: false,
                replay_status: Some(ReplayStatus::Partial),
                actual_step_number: Some(3),
                message: Some("selector drifted".into()),
                ..UndoResponse::default()
            });
        });
        ctl.handle_inbound(Inbound::Snapshot(SessionState {
            session: SessionRecord {
                id: "s1".into(),
                status: SessionStatus::Completed,
                headless: true,
                model: None,
                plan: None,
            },
            steps: steps(6),
        }))
        .await;
        assert_eq!(ctl.replica().watermark(), 6);

        ctl.submit(UserCommand::Undo(5)).await.unwrap();
        assert_eq!(ctl.replica().steps().len(), 3);
        assert_eq!(ctl.connection().watermark, 3);
        assert!(ctl.timeline().last().is_some_and(TimelineEntry::is_error));
        assert!(matches!(
            ctl.last_undo(),
            Some(UndoOutcome::Partial { reached_step: 3, .. })
        ));
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn failed_undo_is_returned_to_caller() {
        let (mut ctl, api, _probe) = planned().await;
        api.with(|s| {
            s.undo = Some(UndoResponse {
                success: false,
                replay_status: Some(ReplayStatus::Failed),
                message: Some("no browser".into()),
                ..UndoResponse::default()
            });
        });
        let err = ctl.submit(UserCommand::Undo(1)).await.unwrap_err();
        assert!(matches!(err, CommandError::Rejected(_)));
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn step_gap_triggers_resync() {
        let (mut ctl, api, _probe) = planned().await;
        api.with(|s| s.steps = steps(4));
        ctl.handle_event(ServerEvent::StepCompleted { step: step(1) })
            .await;
        ctl.handle_event(ServerEvent::StepCompleted { step: step(4) })
            .await;
        assert!(api.calls().contains(&"list_steps:s1".to_string()));
        assert_eq!(ctl.replica().watermark(), 4);
        let step_entries = ctl
            .timeline()
            .entries()
            .iter()
            .filter(|e| matches!(e, TimelineEntry::Step(_)))
            .count();
        assert_eq!(step_entries, 4);
    }

    #[tokio::test]
    async fn run_till_end_skip_flow() {
        let (mut ctl, _api, probe) = planned().await;
        ctl.submit(UserCommand::RunTillEnd).await.unwrap();
        assert_eq!(probe.sent_names(), vec!["run_till_end"]);

        ctl.handle_event(ServerEvent::RunTillEndStarted { total_steps: 5 })
            .await;
        ctl.handle_event(ServerEvent::RunTillEndPaused {
            step_number: 4,
            error: "timeout".into(),
        })
        .await;
        // A paused status does not release the gate while the run is active.
        status(&mut ctl, SessionStatus::Paused).await;
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Executing));

        probe.clear();
        ctl.skip_failed_step().await.unwrap();
        assert_eq!(
            probe.sent_names(),
            vec!["skip_step", "continue_run_till_end"]
        );

        ctl.handle_event(ServerEvent::StepSkipped { step_number: 4 })
            .await;
        ctl.handle_event(ServerEvent::RunTillEndCompleted {
            completed_steps: 4,
            skipped_steps: vec![4],
            success: true,
            cancelled: false,
        })
        .await;
        assert_eq!(ctl.run_phase(), RunPhase::Completed);
        assert!(ctl.run_state().skipped_steps.contains(&4));
        assert_eq!(ctl.run_state().paused_at, None);
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn reset_with_same_id_reattaches() {
        let (mut ctl, api, probe) = planned().await;
        ctl.handle_event(ServerEvent::StepCompleted { step: step(1) })
            .await;

        ctl.reset().await.unwrap();
        assert!(api.calls().contains(&"reset_session:s1".to_string()));
        assert_eq!(ctl.session_id().as_deref(), Some("s1"));
        assert_eq!(probe.attached(), vec!["s1".to_string(), "s1".to_string()]);
        assert_eq!(ctl.replica().watermark(), 0);
        assert_eq!(ctl.replica().status, SessionStatus::PendingPlan);
        assert_eq!(ctl.timeline().len(), 1);
    }

    #[tokio::test]
    async fn resume_requires_paused_status() {
        let (mut ctl, _api, probe) = planned().await;
        assert!(matches!(
            ctl.resume().await,
            Err(CommandError::InvalidState {
                action: "resume",
                ..
            })
        ));
        status(&mut ctl, SessionStatus::Paused).await;
        ctl.resume().await.unwrap();
        assert_eq!(probe.sent_names(), vec!["start"]);
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Executing));
    }

    #[tokio::test]
    async fn commands_without_session_fail() {
        let (mut ctl, _api, _probe) = controller();
        assert!(matches!(ctl.pause().await, Err(CommandError::NoSession)));
        assert!(matches!(
            ctl.submit(UserCommand::Start).await,
            Err(CommandError::NoSession)
        ));
        // The failed first command frees the gate.
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn delete_step_requires_idle_gate() {
        let (mut ctl, api, _probe) = planned().await;
        api.with(|s| s.steps = steps(3));
        ctl.delete_step(2).await.unwrap();
        assert_eq!(ctl.replica().watermark(), 2);

        ctl.submit(UserCommand::Start).await.unwrap();
        assert!(matches!(
            ctl.delete_step(1).await,
            Err(CommandError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_for_other_session_is_ignored() {
        let (mut ctl, _api, _probe) = planned().await;
        ctl.handle_inbound(Inbound::Snapshot(SessionState {
            session: SessionRecord {
                id: "other".into(),
                status: SessionStatus::Running,
                headless: true,
                model: None,
                plan: None,
            },
            steps: steps(2),
        }))
        .await;
        assert_eq!(ctl.replica().watermark(), 0);
    }

    #[tokio::test]
    async fn stop_during_planning_waits_for_decision_on_queue() {
        let (mut ctl, api, _probe) = controller();
        ctl.submit(UserCommand::Instruct("log in".into()))
            .await
            .unwrap();
        let queued = ctl
            .submit(UserCommand::Instruct("then check out".into()))
            .await
            .unwrap();
        assert!(matches!(queued, Submitted::Queued { position: 1, .. }));

        ctl.stop().await.unwrap();
        assert!(api.calls().contains(&"stop_session:s1".to_string()));
        assert_eq!(ctl.replica().status, SessionStatus::Stopped);
        assert_eq!(ctl.gate_state(), GateState::FailurePendingDecision);

        status(&mut ctl, SessionStatus::Cancelled).await;
        assert_eq!(ctl.gate_state(), GateState::FailurePendingDecision);

        ctl.resolve_failure_by_continuing().await.unwrap();
        assert!(api
            .calls()
            .contains(&"continue_session:s1:then check out".to_string()));
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Planning));
        assert_eq!(ctl.gate().queue_len(), 0);
    }

    #[tokio::test]
    async fn cancelled_planning_frees_the_gate() {
        let (mut ctl, _api, _probe) = controller();
        ctl.submit(UserCommand::Instruct("log in".into()))
            .await
            .unwrap();
        status(&mut ctl, SessionStatus::Cancelled).await;
        assert_eq!(ctl.gate_state(), GateState::Idle);
        assert!(ctl.timeline().last().is_some_and(TimelineEntry::is_error));
    }

    #[tokio::test]
    async fn cancel_run_completes_only_once_delivered() {
        let (mut ctl, _api, probe) = paused_run(2).await;

        probe.set_offline(true);
        assert!(not_viable(ctl.cancel_run().await));
        assert_eq!(ctl.run_phase(), RunPhase::Paused);
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Executing));
        assert!(ctl.timeline().last().is_some_and(TimelineEntry::is_error));

        probe.set_offline(false);
        ctl.cancel_run().await.unwrap();
        assert_eq!(probe.sent_names(), vec!["cancel_run_till_end"]);
        assert_eq!(ctl.run_phase(), RunPhase::Completed);
        assert_eq!(ctl.gate_state(), GateState::Idle);

        // The server's tally for the cancelled run changes nothing.
        ctl.handle_event(ServerEvent::RunTillEndCompleted {
            completed_steps: 1,
            skipped_steps: vec![],
            success: false,
            cancelled: true,
        })
        .await;
        assert_eq!(ctl.run_phase(), RunPhase::Completed);
        assert_eq!(ctl.gate_state(), GateState::Idle);
    }

    #[tokio::test]
    async fn skip_can_be_retried_after_send_failure() {
        let (mut ctl, _api, probe) = paused_run(2).await;

        probe.set_offline(true);
        assert!(not_viable(ctl.skip_failed_step().await));
        assert_eq!(ctl.run_phase(), RunPhase::Paused);
        assert!(ctl.run_state().skipped_steps.is_empty());

        probe.set_offline(false);
        ctl.skip_failed_step().await.unwrap();
        assert_eq!(
            probe.sent_names(),
            vec!["skip_step", "continue_run_till_end"]
        );
        assert_eq!(ctl.run_phase(), RunPhase::Running);
        assert!(ctl.run_state().skipped_steps.contains(&2));
    }

    #[tokio::test]
    async fn continue_run_retries_the_paused_step() {
        let (mut ctl, _api, probe) = paused_run(3).await;

        probe.set_offline(true);
        assert!(not_viable(ctl.continue_run().await));
        assert_eq!(ctl.run_phase(), RunPhase::Paused);

        probe.set_offline(false);
        ctl.continue_run().await.unwrap();
        assert_eq!(probe.sent_names(), vec!["continue_run_till_end"]);
        assert_eq!(ctl.run_phase(), RunPhase::Running);
        assert_eq!(ctl.run_state().paused_at, None);
        assert!(ctl.run_state().skipped_steps.is_empty());
    }

    #[tokio::test]
    async fn undo_from_pause_leaves_run_and_rewinds() {
        let (mut ctl, api, _probe) = paused_run(3).await;
        api.with(|s| s.steps = steps(4));

        ctl.undo_from_pause(2).await.unwrap();
        assert!(api.calls().contains(&"undo_to_step:s1:2".to_string()));
        assert_eq!(ctl.run_phase(), RunPhase::Idle);
        assert_eq!(ctl.gate_state(), GateState::Idle);
        assert_eq!(ctl.replica().watermark(), 2);
        assert_eq!(ctl.last_undo(), Some(&UndoOutcome::Full { final_count: 2 }));
    }

    #[tokio::test]
    async fn set_action_enabled_resyncs_steps() {
        let (mut ctl, api, _probe) = planned().await;
        api.with(|s| s.steps = steps(2));

        ctl.set_action_enabled(1, 0, false).await.unwrap();
        assert!(api
            .calls()
            .contains(&"set_action_enabled:s1:1:0:false".to_string()));
        let step = ctl.replica().step(1).unwrap();
        assert!(!step.actions[0].enabled);
        assert_eq!(ctl.replica().watermark(), 2);
    }

    #[tokio::test]
    async fn execution_paused_then_all_stopped() {
        let (mut ctl, _api, _probe) = planned().await;
        ctl.submit(UserCommand::Start).await.unwrap();

        ctl.handle_event(ServerEvent::ExecutionPaused {
            step_number: Some(3),
            message: Some("captcha".into()),
        })
        .await;
        assert_eq!(ctl.replica().status, SessionStatus::Paused);
        assert!(ctl
            .timeline()
            .entries()
            .contains(&TimelineEntry::System("Paused at step 3: captcha".into())));
        assert_eq!(ctl.gate_state(), GateState::Idle);

        ctl.resume().await.unwrap();
        assert_eq!(ctl.gate_state(), GateState::Busy(BusyKind::Executing));

        ctl.handle_event(ServerEvent::AllStopped { message: None })
            .await;
        assert_eq!(ctl.replica().status, SessionStatus::Stopped);
        assert_eq!(ctl.gate_state(), GateState::Idle);
        assert!(ctl
            .timeline()
            .entries()
            .contains(&TimelineEntry::System("All execution stopped".into())));
    }

    #[tokio::test]
    async fn pushed_items_arrive_through_next_inbound() {
        let (mut ctl, _api, probe) = planned().await;
        probe.push(Inbound::ModeChanged(ConnectionMode::Polling));
        probe.push(Inbound::Event(ServerEvent::StepCompleted { step: step(1) }));

        for _ in 0..2 {
            let item = ctl.next_inbound().await.unwrap();
            ctl.handle_inbound(item).await;
        }
        assert_eq!(ctl.replica().watermark(), 1);
        assert_eq!(ctl.timeline().last(), Some(&TimelineEntry::Step(1)));
    }
}
