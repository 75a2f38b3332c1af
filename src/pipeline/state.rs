//! Run state machine.

use std::fmt;
use tracing::{debug, warn};

/// Where a run is in its lifecycle.
///
/// ```text
/// Idle -> Extracting -> Extracted -> Serializing -> Staging -> Staged -> Loading -> Completed
///                    \-> Empty -> Completed              Staged -> Completed (load disabled)
/// ```
///
/// Any non-terminal state may move to `Failed`. For stream runs `Extracting`
/// covers consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Extracting,
    Empty,
    Extracted,
    Serializing,
    Staging,
    Staged,
    Loading,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Empty => "empty",
            RunState::Extracted => "extracted",
            RunState::Serializing => "serializing",
            RunState::Staging => "staging",
            RunState::Staged => "staged",
            RunState::Loading => "loading",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Extracting)
            | (Extracting, Empty | Extracted)
            | (Empty, Completed)
            | (Extracted, Serializing)
            | (Serializing, Staging)
            | (Staging, Staged)
            | (Staged, Loading | Completed)
            | (Loading, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one run plus every state it has been in.
#[derive(Debug, Clone)]
pub struct StateTracker {
    pipeline: String,
    history: Vec<RunState>,
}

impl StateTracker {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            history: vec![RunState::Idle],
        }
    }

    pub fn current(&self) -> RunState {
        self.history
            .last()
            .copied()
            .unwrap_or(RunState::Idle)
    }

    /// Move to `next`. Transitions the state machine does not allow are
    /// ignored and logged.
    pub fn advance(&mut self, next: RunState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(
                pipeline = %self.pipeline,
                from = %current,
                to = %next,
                "Ignoring invalid run state transition"
            );
            return;
        }

        debug!(pipeline = %self.pipeline, from = %current, to = %next, "Run state changed");
        self.history.push(next);
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_window_path() {
        let mut tracker = StateTracker::new("tickets");
        for state in [
            RunState::Extracting,
            RunState::Extracted,
            RunState::Serializing,
            RunState::Staging,
            RunState::Staged,
            RunState::Loading,
            RunState::Completed,
        ] {
            tracker.advance(state);
        }
        assert_eq!(tracker.current(), RunState::Completed);
        assert_eq!(tracker.history().len(), 8);
    }

    #[test]
    fn test_empty_short_circuits() {
        let mut tracker = StateTracker::new("tickets");
        tracker.advance(RunState::Extracting);
        tracker.advance(RunState::Empty);
        tracker.advance(RunState::Completed);
        assert_eq!(
            tracker.history(),
            &[
                RunState::Idle,
                RunState::Extracting,
                RunState::Empty,
                RunState::Completed
            ]
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut tracker = StateTracker::new("tickets");
        tracker.advance(RunState::Extracting);
        tracker.advance(RunState::Failed);
        tracker.advance(RunState::Extracted);
        assert_eq!(tracker.current(), RunState::Failed);
        assert!(RunState::Failed.is_terminal());
    }

    #[test]
    fn test_cannot_skip_staging() {
        assert!(!RunState::Extracted.can_transition_to(RunState::Loading));
        assert!(!RunState::Empty.can_transition_to(RunState::Staging));
        assert!(RunState::Staged.can_transition_to(RunState::Completed));
        assert!(RunState::Serializing.can_transition_to(RunState::Failed));
    }
}
