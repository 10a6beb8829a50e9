//! Wire types for the session channel and the REST snapshot.
//!
//! All channel frames are JSON text messages.
//!
//! ## Client → server (`{"command": ..., ...params}`)
//!
//! | Command                 | Params                     |
//! |-------------------------|----------------------------|
//! | `subscribe`             | `session_id`               |
//! | `ping`                  | none                        |
//! | `start`                 | `headless?`, `model?`      |
//! | `inject_command`        | `text`                     |
//! | `run_till_end`          | none                        |
//! | `skip_step`             | `step_number`              |
//! | `continue_run_till_end` | none                        |
//! | `cancel_run_till_end`   | none                        |
//! | `pause_execution`       | none                        |
//!
//! ## Server → client (`{"type": ..., ...payload}`)
//!
//! | Type                     | Key fields                                              |
//! |--------------------------|---------------------------------------------------------|
//! | `initial_state`          | `session`, `steps[]`                                    |
//! | `step_completed`         | `step`                                                  |
//! | `status_changed`         | `status`                                                |
//! | `completed`              | `status?`, `success?`, `message?`                       |
//! | `error`                  | `message` (or `error`)                                  |
//! | `pong`                   | none                                                     |
//! | `run_till_end_started`   | `total_steps`                                           |
//! | `run_till_end_progress`  | `current_step`, `total_steps?`                          |
//! | `run_till_end_paused`    | `step_number`, `error`                                  |
//! | `run_till_end_completed` | `completed_steps`, `skipped_steps[]`, `success`, `cancelled?` |
//! | `step_skipped`           | `step_number`                                           |
//! | `execution_paused`       | `step_number?`, `message?`                              |
//! | `all_stopped`            | `message?`                                              |
//!
//! Any other `type` decodes to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Server-side lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    PendingPlan,
    GeneratingPlan,
    PlanReady,
    Approved,
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
    Paused,
    Cancelled,
    RecordingReady,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingPlan => "pending_plan",
            Self::GeneratingPlan => "generating_plan",
            Self::PlanReady => "plan_ready",
            Self::Approved => "approved",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::RecordingReady => "recording_ready",
        }
    }

    /// Execution has come to rest: nothing is running server-side.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Stopped
                | Self::Paused
                | Self::Cancelled
                | Self::RecordingReady
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// One browser action performed inside a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    /// Disabled actions are skipped on later replay but not deleted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One executed unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_number: u32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub evaluation: Option<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Generated plan for a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub approved: bool,
}

/// Server's record of a session (without its steps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub headless: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
}

/// Full authoritative snapshot: the polling payload and the `initial_state` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session: SessionRecord,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// How far a server-side replay got after an undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Passed,
    Partial,
    Failed,
}

/// Response body of `POST /api/sessions/{id}/undo`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UndoResponse {
    pub success: bool,
    #[serde(default)]
    pub replay_status: Option<ReplayStatus>,
    /// Step the replay actually reached (set on partial replay).
    #[serde(default)]
    pub actual_step_number: Option<u32>,
    #[serde(default)]
    pub steps_removed: Option<u32>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

/// Client → server command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        session_id: String,
    },
    Ping,
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headless: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    InjectCommand {
        text: String,
    },
    RunTillEnd,
    SkipStep {
        step_number: u32,
    },
    ContinueRunTillEnd,
    CancelRunTillEnd,
    PauseExecution,
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Ping => "ping",
            Self::Start { .. } => "start",
            Self::InjectCommand { .. } => "inject_command",
            Self::RunTillEnd => "run_till_end",
            Self::SkipStep { .. } => "skip_step",
            Self::ContinueRunTillEnd => "continue_run_till_end",
            Self::CancelRunTillEnd => "cancel_run_till_end",
            Self::PauseExecution => "pause_execution",
        }
    }

    /// Connection-management commands that have no meaning over REST.
    pub fn is_channel_only(&self) -> bool {
        matches!(self, Self::Subscribe { .. } | Self::Ping)
    }
}

/// Server → client event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    InitialState {
        session: SessionRecord,
        #[serde(default)]
        steps: Vec<Step>,
    },
    StepCompleted {
        step: Step,
    },
    StatusChanged {
        status: SessionStatus,
    },
    Completed {
        #[serde(default)]
        status: Option<SessionStatus>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
    Pong,
    RunTillEndStarted {
        total_steps: u32,
    },
    RunTillEndProgress {
        current_step: u32,
        #[serde(default)]
        total_steps: Option<u32>,
    },
    RunTillEndPaused {
        step_number: u32,
        #[serde(default)]
        error: String,
    },
    RunTillEndCompleted {
        #[serde(default)]
        completed_steps: u32,
        #[serde(default)]
        skipped_steps: Vec<u32>,
        success: bool,
        #[serde(default)]
        cancelled: bool,
    },
    StepSkipped {
        step_number: u32,
    },
    ExecutionPaused {
        #[serde(default)]
        step_number: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },
    AllStopped {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Decode one inbound text frame.
///
/// Unparseable frames are logged and dropped so a single bad event never
/// poisons the merge loop.
pub fn parse_event(text: &str) -> Option<ServerEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Protocol: dropping non-JSON frame: {e}");
            return None;
        }
    };
    let event_type = value["type"].as_str().unwrap_or("").to_string();
    match serde_json::from_value::<ServerEvent>(value) {
        Ok(ServerEvent::Unknown) => {
            debug!(event_type, "Protocol: unknown event type");
            Some(ServerEvent::Unknown)
        }
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event_type, "Protocol: dropping malformed event: {e}");
            None
        }
    }
}
