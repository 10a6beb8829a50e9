//! User-facing projection of the session.
//!
//! Append-only; rebuilt from merge results and command outcomes, never
//! diffed against the server.

use std::fmt;

use crate::protocol::Plan;

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    User(String),
    Assistant(String),
    Plan(Plan),
    /// Reference to a step by number; the step itself lives in the replica.
    Step(u32),
    Error(String),
    System(String),
    Waiting(String),
}

impl TimelineEntry {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for TimelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(text) => write!(f, "> {text}"),
            Self::Assistant(text) | Self::System(text) => f.write_str(text),
            Self::Plan(plan) => {
                write!(f, "Plan ({} steps)", plan.steps.len())?;
                for (i, line) in plan.steps.iter().enumerate() {
                    write!(f, "\n  {}. {line}", i + 1)?;
                }
                Ok(())
            }
            Self::Step(n) => write!(f, "Step {n}"),
            Self::Error(text) => write!(f, "error: {text}"),
            Self::Waiting(text) => write!(f, "… {text}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn push(&mut self, entry: TimelineEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Entries appended after the first `seen`.
    pub fn since(&self, seen: usize) -> &[TimelineEntry] {
        &self.entries[seen.min(self.entries.len())..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
