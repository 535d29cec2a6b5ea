use serde::{Deserialize, Serialize};
use std::fmt;

use cs_core::types::TaskState;

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Analyze,
    Generate,
    Build,
    Test,
    Fix,
    Complete,
    Fail,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::Analyze => "Analyze",
            TaskEvent::Generate => "Generate",
            TaskEvent::Build => "Build",
            TaskEvent::Test => "Test",
            TaskEvent::Fix => "Fix",
            TaskEvent::Complete => "Complete",
            TaskEvent::Fail => "Fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// An event was applied in a state that does not accept it.
///
/// Terminal states accept nothing, so a completed or failed task can never
/// be moved again.
#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: TaskState, event: TaskEvent },
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: TaskState,
    history: Vec<(TaskState, TaskEvent, TaskState)>,
}

fn next_state(state: TaskState, event: TaskEvent) -> Option<TaskState> {
    use TaskEvent as E;
    use TaskState as S;
    let next = match (state, event) {
        (S::Pending, E::Analyze) => S::Analyzing,
        (S::Analyzing, E::Generate) => S::Generating,
        (S::Generating, E::Build) => S::Building,
        // generate-only and degraded runs finish straight after generation
        (S::Generating, E::Complete) => S::Completed,
        (S::Building, E::Test) => S::Testing,
        (S::Testing, E::Fix) => S::Fixing,
        (S::Fixing, E::Test) => S::Testing,
        (S::Testing, E::Complete) => S::Completed,
        (s, E::Fail) if !s.is_terminal() => S::Failed,
        _ => return None,
    };
    Some(next)
}

impl TaskStateMachine {
    /// Start in `Pending`.
    pub fn new() -> Self {
        Self::resume(TaskState::Pending)
    }

    /// Continue from an existing state.
    pub fn resume(state: TaskState) -> Self {
        Self {
            current: state,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.current
    }

    pub fn history(&self) -> &[(TaskState, TaskEvent, TaskState)] {
        &self.history
    }

    /// Valid transitions:
    /// - Pending    + Analyze  -> Analyzing
    /// - Analyzing  + Generate -> Generating
    /// - Generating + Build    -> Building
    /// - Generating + Complete -> Completed
    /// - Building   + Test     -> Testing
    /// - Testing    + Fix      -> Fixing
    /// - Fixing     + Test     -> Testing
    /// - Testing    + Complete -> Completed
    /// - any non-terminal + Fail -> Failed
    pub fn transition(&mut self, event: TaskEvent) -> Result<TaskState, StateMachineError> {
        let next = next_state(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;
        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "task state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: TaskEvent) -> bool {
        next_state(self.current, event).is_some()
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
