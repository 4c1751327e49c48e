//! Seam to the application that executes committed commands.
//!
//! The consensus core hands each committed entry's command to the state
//! machine exactly once per process, strictly in index order. What the
//! command means is entirely the application's business.

use crate::log::{Command, LogIndex};

/// The application side of the replicated log.
pub trait StateMachine: Send {
    fn apply(&mut self, index: LogIndex, command: &Command);
}

/// A state machine that just records what was applied, in order. Useful as
/// a demo application and for observing replication in tests.
#[derive(Debug, Default)]
pub struct AppliedLog {
    entries: Vec<(LogIndex, Command)>,
}

impl AppliedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(LogIndex, Command)] {
        &self.entries
    }
}

impl StateMachine for AppliedLog {
    fn apply(&mut self, index: LogIndex, command: &Command) {
        self.entries.push((index, command.clone()));
    }
}
