//! The active session id.
//!
//! Exactly one [`SessionCell`] exists per controller and it is the only
//! writer. Every deferred task (poll tick, reconnect timer, upgrade attempt,
//! heartbeat) holds a [`SessionCellReader`] plus the generation it was
//! scheduled under, and resolves the id at fire time with
//! [`SessionCellReader::resolve`]. A task scheduled before a session switch
//! therefore sees `None` and exits instead of acting on the old session.

use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Active {
    generation: u64,
    session_id: Option<String>,
}

/// Single writer of the active session id.
#[derive(Debug)]
pub struct SessionCell {
    tx: watch::Sender<Active>,
}

/// Read handle; cheap to clone into timer tasks.
#[derive(Debug, Clone)]
pub struct SessionCellReader {
    rx: watch::Receiver<Active>,
}

impl Default for SessionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Active::default());
        Self { tx }
    }

    /// Replace the active id and return the new generation.
    ///
    /// The generation advances even when `id` equals the current id, so a
    /// reset of the same session still invalidates previously scheduled work.
    pub fn set(&self, id: Option<String>) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|active| {
            active.generation += 1;
            active.session_id = id;
            generation = active.generation;
        });
        generation
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().session_id.clone()
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().generation
    }

    pub fn reader(&self) -> SessionCellReader {
        SessionCellReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl SessionCellReader {
    pub fn current(&self) -> Option<String> {
        self.rx.borrow().session_id.clone()
    }

    pub fn generation(&self) -> u64 {
        self.rx.borrow().generation
    }

    /// The active id, but only if it is still the one from `generation`.
    pub fn resolve(&self, generation: u64) -> Option<String> {
        let active = self.rx.borrow();
        if active.generation == generation {
            active.session_id.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_resolves_to_none() {
        let cell = SessionCell::new();
        let reader = cell.reader();

        let g1 = cell.set(Some("a".into()));
        assert_eq!(reader.resolve(g1).as_deref(), Some("a"));

        let g2 = cell.set(Some("b".into()));
        assert_eq!(reader.resolve(g1), None);
        assert_eq!(reader.resolve(g2).as_deref(), Some("b"));
        assert_eq!(reader.current().as_deref(), Some("b"));
    }

    #[test]
    fn same_id_still_bumps_generation() {
        let cell = SessionCell::new();
        let reader = cell.reader();
        let g1 = cell.set(Some("a".into()));
        let g2 = cell.set(Some("a".into()));
        assert!(g2 > g1);
        assert_eq!(reader.resolve(g1), None);
    }

    #[test]
    fn clearing_invalidates_everything() {
        let cell = SessionCell::new();
        let reader = cell.reader();
        let g = cell.set(Some("a".into()));
        cell.set(None);
        assert_eq!(reader.resolve(g), None);
        assert_eq!(cell.current(), None);
        assert_eq!(reader.generation(), cell.generation());
    }
}
