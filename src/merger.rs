//! Local replica of the server-owned session.
//!
//! `watermark` is the count of steps already merged and the only
//! de-duplication key. Step lists from either transport are merged by
//! appending the suffix beyond the watermark, so overlapping delivery (a poll
//! racing a channel event) is idempotent. The watermark only moves backwards
//! through [`SessionReplica::resync`] and [`SessionReplica::clear`], which
//! replace history wholesale from an authoritative list.

use tracing::{debug, warn};

use crate::protocol::{Plan, SessionRecord, SessionState, SessionStatus, Step};

/// Result of merging a step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Steps appended by this merge.
    pub appended: usize,
    /// A single-step event skipped ahead of the watermark.
    pub gap: Option<Gap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub expected: u32,
    pub received: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReplica {
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub plan: Option<Plan>,
    pub headless: bool,
    pub model: Option<String>,
    steps: Vec<Step>,
    watermark: usize,
}

impl SessionReplica {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::default()
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn step(&self, step_number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// Apply the session record fields that are not append-only.
    pub fn apply_record(&mut self, record: &SessionRecord) {
        self.session_id = Some(record.id.clone());
        self.status = record.status;
        self.headless = record.headless;
        self.model.clone_from(&record.model);
        if record.plan.is_some() {
            self.plan.clone_from(&record.plan);
        }
    }

    /// `initial_state` from the channel: record fields plus suffix merge.
    pub fn apply_initial_state(&mut self, record: &SessionRecord, steps: &[Step]) -> MergeOutcome {
        self.apply_record(record);
        self.apply_incremental_steps(steps)
    }

    /// A full step list from any source; only the suffix past the watermark
    /// is appended.
    pub fn apply_incremental_steps(&mut self, steps: &[Step]) -> MergeOutcome {
        if steps.len() <= self.watermark {
            return MergeOutcome::default();
        }
        let suffix = &steps[self.watermark..];
        self.steps.extend_from_slice(suffix);
        self.watermark = steps.len();
        debug!(
            appended = suffix.len(),
            watermark = self.watermark,
            "Merger: appended steps"
        );
        MergeOutcome {
            appended: suffix.len(),
            gap: None,
        }
    }

    /// A single `step_completed` event.
    ///
    /// Numbers at or below the watermark are duplicates. A number past
    /// `watermark + 1` is not appended and reported as a gap.
    pub fn apply_step_event(&mut self, step: &Step) -> MergeOutcome {
        let next = self.watermark as u32 + 1;
        if step.step_number < next {
            return MergeOutcome::default();
        }
        if step.step_number > next {
            warn!(
                expected = next,
                received = step.step_number,
                "Merger: step gap, re-sync required"
            );
            return MergeOutcome {
                appended: 0,
                gap: Some(Gap {
                    expected: next,
                    received: step.step_number,
                }),
            };
        }
        self.steps.push(step.clone());
        self.watermark += 1;
        MergeOutcome {
            appended: 1,
            gap: None,
        }
    }

    /// Last write wins. Returns the previous status when it changed.
    pub fn apply_status_change(&mut self, status: SessionStatus) -> Option<SessionStatus> {
        let previous = std::mem::replace(&mut self.status, status);
        (previous != status).then_some(previous)
    }

    /// A polling snapshot.
    pub fn apply_snapshot(&mut self, snapshot: &SessionState) -> (MergeOutcome, Option<SessionStatus>) {
        let previous = self.status;
        self.apply_record(&snapshot.session);
        let changed = (previous != self.status).then_some(previous);
        (self.apply_incremental_steps(&snapshot.steps), changed)
    }

    /// Replace history with a fresh authoritative list.
    pub fn resync(&mut self, steps: Vec<Step>) {
        debug!(
            from = self.watermark,
            to = steps.len(),
            "Merger: re-synchronized from server"
        );
        self.watermark = steps.len();
        self.steps = steps;
    }

    /// Keep only the first `count` steps. Used when a re-sync fetch failed
    /// after the server already truncated.
    pub fn truncate_to(&mut self, count: usize) {
        self.steps.truncate(count);
        self.watermark = self.steps.len();
    }

    /// Drop everything except identity.
    pub fn clear(&mut self) {
        let session_id = self.session_id.take();
        *self = Self {
            session_id,
            ..Self::default()
        };
    }
}
