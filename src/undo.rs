//! Undo/replay and single-step history edits.
//!
//! Every successful history edit re-synchronizes the replica wholesale from
//! the server's step list. Nothing is patched locally from a diff.

use tracing::{info, warn};

use crate::client::SessionApi;
use crate::error::ClientError;
use crate::merger::SessionReplica;
use crate::protocol::{ReplayStatus, UndoResponse};

/// Three-way result of an undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// Rewound to the target; `final_count` steps remain.
    Full { final_count: usize },
    /// Replay stopped early at `reached_step`; history was still truncated.
    Partial {
        actual_count: usize,
        reached_step: u32,
        message: String,
    },
    /// Nothing changed server-side.
    Failed { message: String },
}

impl UndoOutcome {
    pub fn user_message(&self, target: u32) -> String {
        match self {
            Self::Full { final_count } => {
                format!("Undid to step {target} ({final_count} steps remain)")
            }
            Self::Partial {
                reached_step,
                message,
                ..
            } => format!(
                "Replay stopped at step {reached_step} instead of {target}: {message}"
            ),
            Self::Failed { message } => format!("Undo to step {target} failed: {message}"),
        }
    }
}

/// Server's undo response, before reconciliation. Counts are provisional.
pub fn classify(response: &UndoResponse, target: u32) -> UndoOutcome {
    let message = || {
        response
            .message
            .clone()
            .unwrap_or_else(|| "replay failed".to_string())
    };
    if response.success && response.replay_status != Some(ReplayStatus::Partial) {
        return UndoOutcome::Full {
            final_count: target as usize,
        };
    }
    match (response.replay_status, response.actual_step_number) {
        (Some(ReplayStatus::Partial), Some(reached)) => UndoOutcome::Partial {
            actual_count: reached as usize,
            reached_step: reached,
            message: message(),
        },
        // Partial without a position: the mutation happened, position unknown.
        (Some(ReplayStatus::Partial), None) => UndoOutcome::Partial {
            actual_count: 0,
            reached_step: 0,
            message: message(),
        },
        _ => UndoOutcome::Failed { message: message() },
    }
}

/// Rewind `session_id` to `target` and reconcile `replica`.
///
/// A REST failure is a [`UndoOutcome::Failed`]: the replica is untouched.
pub async fn undo_to_step(
    api: &dyn SessionApi,
    replica: &mut SessionReplica,
    session_id: &str,
    target: u32,
) -> UndoOutcome {
    info!("Undo: rewinding {session_id} to step {target}");
    let response = match api.undo_to_step(session_id, target).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Undo: request failed: {e}");
            return UndoOutcome::Failed {
                message: e.to_string(),
            };
        }
    };

    match classify(&response, target) {
        UndoOutcome::Failed { message } => {
            warn!("Undo: server reported failure: {message}");
            UndoOutcome::Failed { message }
        }
        UndoOutcome::Full { final_count } => {
            let final_count = resync_or_truncate(api, replica, session_id, final_count).await;
            UndoOutcome::Full { final_count }
        }
        UndoOutcome::Partial {
            actual_count,
            reached_step,
            message,
        } => {
            warn!("Undo: partial replay, reached step {reached_step}: {message}");
            let actual_count = resync_or_truncate(api, replica, session_id, actual_count).await;
            UndoOutcome::Partial {
                actual_count,
                reached_step,
                message,
            }
        }
    }
}

/// Delete one step server-side, then re-sync (renumbering comes from the server).
pub async fn delete_step(
    api: &dyn SessionApi,
    replica: &mut SessionReplica,
    session_id: &str,
    step_number: u32,
) -> Result<usize, ClientError> {
    api.delete_step(session_id, step_number).await?;
    refresh_steps(api, replica, session_id).await
}

/// Replace the replica's steps with the server's list. Returns the new count.
pub async fn refresh_steps(
    api: &dyn SessionApi,
    replica: &mut SessionReplica,
    session_id: &str,
) -> Result<usize, ClientError> {
    let steps = api.list_steps(session_id).await?;
    replica.resync(steps);
    Ok(replica.watermark())
}

/// The server already truncated; if the fresh list cannot be fetched, fall
/// back to the reported count so the replica never shows removed steps.
async fn resync_or_truncate(
    api: &dyn SessionApi,
    replica: &mut SessionReplica,
    session_id: &str,
    reported: usize,
) -> usize {
    match refresh_steps(api, replica, session_id).await {
        Ok(count) => count,
        Err(e) => {
            warn!("Undo: step refresh failed, truncating to {reported}: {e}");
            replica.truncate_to(reported);
            replica.watermark()
        }
    }
}
