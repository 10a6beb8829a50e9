//! Run-till-end: unattended execution of all remaining steps, pausing on
//! failure.
//!
//! ```text
//!  Idle ──start──► Running ──paused──► Paused
//!                   ▲   │                │ skip / continue ─► Running
//!                   │   │ completed      │ cancel ──────────► Completed{cancelled}
//!                   │   ▼                │ undo ────────────► Idle
//!                   └─ Completed ◄───────┘
//! ```
//!
//! A terminal `run_till_end_completed` always carries the final tally. After a
//! local cancel the controller is already `Completed`; the late server tally
//! is surfaced as [`RunUpdate::FinalTally`].

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::CommandError;
use crate::protocol::{ClientCommand, ServerEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PausedAt {
    pub step_number: u32,
    pub error: String,
    /// Skip was requested and the server has not confirmed it yet.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTillEndState {
    pub running: bool,
    pub paused_at: Option<PausedAt>,
    pub skipped_steps: BTreeSet<u32>,
    /// UI highlighting only.
    pub currently_executing_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub completed_steps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub completed_steps: u32,
    pub skipped_steps: Vec<u32>,
    pub success: bool,
    pub cancelled: bool,
}

/// What changed after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunUpdate {
    Started { total_steps: u32 },
    Progress { current_step: u32 },
    Paused { step_number: u32, error: String },
    StepSkipped(u32),
    Completed(RunSummary),
    /// Server tally arriving after a local cancel.
    FinalTally(RunSummary),
}

#[derive(Debug, Default)]
pub struct RunTillEnd {
    phase: RunPhase,
    state: RunTillEndState,
    /// A cancelled run's tally has not arrived yet.
    awaiting_tally: bool,
    /// The server acknowledged the current run with `run_till_end_started`.
    acknowledged: bool,
}

impl RunTillEnd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn state(&self) -> &RunTillEndState {
        &self.state
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, RunPhase::Running | RunPhase::Paused)
    }

    // Each action is split in two: the command to send, and the local commit
    // once the send went through. A failed send leaves the state untouched.

    pub fn start(&self) -> Result<ClientCommand, CommandError> {
        if self.is_active() {
            return Err(self.invalid("run till end"));
        }
        Ok(ClientCommand::RunTillEnd)
    }

    pub fn commit_start(&mut self) {
        self.state = RunTillEndState {
            running: true,
            ..RunTillEndState::default()
        };
        self.phase = RunPhase::Running;
        self.acknowledged = false;
    }

    /// Commands that skip the failed step and keep going, in order. Once the
    /// skip itself went out only the continue remains.
    pub fn skip(&self) -> Result<(u32, Vec<ClientCommand>), CommandError> {
        let paused = self.paused("skip")?;
        let step_number = paused.step_number;
        let mut commands = Vec::with_capacity(2);
        if !paused.skipped {
            commands.push(ClientCommand::SkipStep { step_number });
        }
        commands.push(ClientCommand::ContinueRunTillEnd);
        Ok((step_number, commands))
    }

    /// The skip command was delivered; the continue may still be pending.
    pub fn mark_skip_sent(&mut self) {
        if let Some(p) = self.state.paused_at.as_mut() {
            p.skipped = true;
        }
    }

    pub fn commit_skip(&mut self, step_number: u32) {
        self.mark_skip_sent();
        self.state.skipped_steps.insert(step_number);
        self.resume_running();
        info!("RunTillEnd: skipping step {step_number}");
    }

    /// Retry from the paused step without skipping it.
    pub fn continue_run(&self) -> Result<ClientCommand, CommandError> {
        self.paused("continue")?;
        Ok(ClientCommand::ContinueRunTillEnd)
    }

    pub fn commit_continue(&mut self) {
        self.state.paused_at = None;
        self.resume_running();
    }

    /// Abort the run.
    pub fn cancel(&self) -> Result<ClientCommand, CommandError> {
        if !self.is_active() {
            return Err(self.invalid("cancel"));
        }
        Ok(ClientCommand::CancelRunTillEnd)
    }

    /// Complete locally. The server's tally arrives later as
    /// [`RunUpdate::FinalTally`].
    pub fn commit_cancel(&mut self) -> RunSummary {
        let summary = RunSummary {
            completed_steps: self.state.completed_steps,
            skipped_steps: self.state.skipped_steps.iter().copied().collect(),
            success: false,
            cancelled: true,
        };
        self.finish();
        self.awaiting_tally = true;
        info!("RunTillEnd: cancelled");
        summary
    }

    /// Leave the run to undo from the paused step. Returns that step.
    pub fn exit_for_undo(&mut self) -> Result<u32, CommandError> {
        let paused = self.paused("undo")?.step_number;
        self.reset();
        Ok(paused)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn on_event(&mut self, event: &ServerEvent) -> Option<RunUpdate> {
        match event {
            ServerEvent::RunTillEndStarted { total_steps } => {
                self.phase = RunPhase::Running;
                self.acknowledged = true;
                self.state.running = true;
                self.state.total_steps = Some(*total_steps);
                Some(RunUpdate::Started {
                    total_steps: *total_steps,
                })
            }
            ServerEvent::RunTillEndProgress {
                current_step,
                total_steps,
            } => {
                if self.phase != RunPhase::Running {
                    return None;
                }
                self.state.currently_executing_step = Some(*current_step);
                if total_steps.is_some() {
                    self.state.total_steps = *total_steps;
                }
                Some(RunUpdate::Progress {
                    current_step: *current_step,
                })
            }
            ServerEvent::StepCompleted { .. } if self.phase == RunPhase::Running => {
                self.state.completed_steps += 1;
                None
            }
            ServerEvent::RunTillEndPaused { step_number, error } => {
                if !self.is_active() {
                    return None;
                }
                self.phase = RunPhase::Paused;
                self.state.running = false;
                self.state.currently_executing_step = None;
                self.state.paused_at = Some(PausedAt {
                    step_number: *step_number,
                    error: error.clone(),
                    skipped: false,
                });
                info!("RunTillEnd: paused at step {step_number}: {error}");
                Some(RunUpdate::Paused {
                    step_number: *step_number,
                    error: error.clone(),
                })
            }
            ServerEvent::StepSkipped { step_number } => {
                self.state.skipped_steps.insert(*step_number);
                if self
                    .state
                    .paused_at
                    .as_ref()
                    .is_some_and(|p| p.step_number == *step_number)
                {
                    self.state.paused_at = None;
                }
                if self.phase == RunPhase::Paused {
                    self.resume_running();
                }
                Some(RunUpdate::StepSkipped(*step_number))
            }
            ServerEvent::RunTillEndCompleted {
                completed_steps,
                skipped_steps,
                success,
                cancelled,
            } => {
                let summary = RunSummary {
                    completed_steps: *completed_steps,
                    skipped_steps: skipped_steps.clone(),
                    success: *success,
                    cancelled: *cancelled,
                };
                // Before the next run is acknowledged, a tally belongs to the
                // cancelled one.
                if std::mem::take(&mut self.awaiting_tally)
                    && !(self.is_active() && self.acknowledged)
                {
                    debug!("RunTillEnd: final tally after cancel");
                    return Some(RunUpdate::FinalTally(summary));
                }
                self.state.skipped_steps.extend(skipped_steps.iter().copied());
                self.state.completed_steps = *completed_steps;
                self.finish();
                info!(
                    "RunTillEnd: completed ({completed_steps} done, {} skipped, success={success})",
                    skipped_steps.len()
                );
                Some(RunUpdate::Completed(summary))
            }
            _ => None,
        }
    }

    fn resume_running(&mut self) {
        self.phase = RunPhase::Running;
        self.state.running = true;
    }

    fn finish(&mut self) {
        self.phase = RunPhase::Completed;
        self.state.running = false;
        self.state.paused_at = None;
        self.state.currently_executing_step = None;
    }

    fn paused(&self, action: &'static str) -> Result<&PausedAt, CommandError> {
        match (self.phase, self.state.paused_at.as_ref()) {
            (RunPhase::Paused, Some(p)) => Ok(p),
            _ => Err(self.invalid(action)),
        }
    }

    fn invalid(&self, action: &'static str) -> CommandError {
        CommandError::InvalidState {
            action,
            state: self.phase.as_str(),
        }
    }
}
