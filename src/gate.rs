//! Command gate and queue.
//!
//! At most one user command is outstanding. The gate is a single
//! [`GateState`] value, so "planning and executing at once" cannot be
//! represented.
//!
//! ```text
//!         submit                 complete(ok), queue empty
//!  Idle ──────────► Busy(kind) ─────────────────────────► Idle
//!                    │   ▲  complete(ok), queue non-empty: dispatch next
//!                    │   └──────┘
//!                    │ complete(failed), queue non-empty
//!                    ▼
//!        FailurePendingDecision ── discard ──► Idle
//!                    └──────────── continue ─► Busy(next) | Idle
//! ```
//!
//! An instruction submitted while `Busy(Executing)` is not queued; it is
//! returned as [`Admission::Inject`] so the caller forwards it as a hint to
//! the running execution.

use std::collections::VecDeque;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the outstanding command is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    Planning,
    Executing,
    Undoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Idle,
    Busy(BusyKind),
    /// The previous command failed and commands are queued behind it.
    FailurePendingDecision,
}

impl GateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy(BusyKind::Planning) => "planning",
            Self::Busy(BusyKind::Executing) => "executing",
            Self::Busy(BusyKind::Undoing) => "undoing",
            Self::FailurePendingDecision => "waiting for a decision after a failure",
        }
    }

    pub fn is_busy(self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Commands that occupy the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Create a session or continue the current one with a new instruction.
    Instruct(String),
    /// Approve the plan (if needed) and start execution.
    Start,
    RunTillEnd,
    Undo(u32),
}

impl UserCommand {
    pub fn busy_kind(&self) -> BusyKind {
        match self {
            Self::Instruct(_) => BusyKind::Planning,
            Self::Start | Self::RunTillEnd => BusyKind::Executing,
            Self::Undo(_) => BusyKind::Undoing,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Instruct(text) => text.clone(),
            Self::Start => "start".into(),
            Self::RunTillEnd => "run till end".into(),
            Self::Undo(n) => format!("undo to step {n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub payload: UserCommand,
    pub submitted_at_ms: u64,
}

impl QueuedCommand {
    fn new(payload: UserCommand) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            submitted_at_ms: now_ms(),
        }
    }
}

/// What the caller must do with a submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Execute now; the gate is busy with it.
    Dispatch(QueuedCommand),
    /// Held in the queue at 1-based `position`.
    Queued { id: Uuid, position: usize },
    /// Forward as a hint to the running execution.
    Inject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct CommandGate {
    state: watch::Sender<GateState>,
    queue: VecDeque<QueuedCommand>,
}

impl Default for CommandGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Idle);
        Self {
            state,
            queue: VecDeque::new(),
        }
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Observe busy/idle transitions.
    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn set(&self, state: GateState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Gate: {} -> {}", current.as_str(), state.as_str());
            *current = state;
            true
        });
    }

    pub fn submit(&mut self, command: UserCommand) -> Admission {
        match (self.state(), command) {
            (GateState::Idle, command) => {
                self.set(GateState::Busy(command.busy_kind()));
                Admission::Dispatch(QueuedCommand::new(command))
            }
            (GateState::Busy(BusyKind::Executing), UserCommand::Instruct(text)) => {
                debug!("Gate: execution in flight, forwarding instruction as hint");
                Admission::Inject(text)
            }
            (_, command) => {
                let queued = QueuedCommand::new(command);
                let id = queued.id;
                self.queue.push_back(queued);
                let position = self.queue.len();
                info!("Gate: queued command at position {position}");
                Admission::Queued { id, position }
            }
        }
    }

    /// Finish the outstanding command. Returns the next command to execute,
    /// already admitted, if the queue drains.
    pub fn complete(&mut self, outcome: Completion) -> Option<QueuedCommand> {
        if !self.state().is_busy() {
            debug!("Gate: completion while {}, ignored", self.state().as_str());
            return None;
        }
        if outcome == Completion::Failed && !self.queue.is_empty() {
            warn!(
                "Gate: command failed with {} queued, waiting for a decision",
                self.queue.len()
            );
            self.set(GateState::FailurePendingDecision);
            return None;
        }
        self.drain_next()
    }

    /// Drop every queued command. Only valid after a failure.
    pub fn resolve_failure_by_discarding(&mut self) -> Vec<QueuedCommand> {
        if self.state() != GateState::FailurePendingDecision {
            return Vec::new();
        }
        let discarded: Vec<_> = self.queue.drain(..).collect();
        info!("Gate: discarded {} queued command(s)", discarded.len());
        self.set(GateState::Idle);
        discarded
    }

    /// Clear the failure and resume draining.
    pub fn resolve_failure_by_continuing(&mut self) -> Option<QueuedCommand> {
        if self.state() != GateState::FailurePendingDecision {
            return None;
        }
        info!("Gate: continuing with queued commands");
        self.drain_next()
    }

    /// Change what the outstanding command is doing.
    pub fn rebind(&mut self, kind: BusyKind) {
        if self.state().is_busy() {
            self.set(GateState::Busy(kind));
        }
    }

    /// Occupy the gate for work that did not come through [`Self::submit`].
    /// Returns `false` if the gate was not idle.
    pub fn acquire(&mut self, kind: BusyKind) -> bool {
        if self.state() != GateState::Idle {
            return false;
        }
        self.set(GateState::Busy(kind));
        true
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.set(GateState::Idle);
    }

    fn drain_next(&mut self) -> Option<QueuedCommand> {
        match self.queue.pop_front() {
            Some(next) => {
                self.set(GateState::Busy(next.payload.busy_kind()));
                Some(next)
            }
            None => {
                self.set(GateState::Idle);
                None
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
