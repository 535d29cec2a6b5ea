use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Analyzing,
    Generating,
    Building,
    Testing,
    Fixing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// States during which the task holds a container.
    pub fn holds_container(&self) -> bool {
        matches!(
            self,
            TaskState::Building | TaskState::Testing | TaskState::Fixing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Analyzing => "analyzing",
            TaskState::Generating => "generating",
            TaskState::Building => "building",
            TaskState::Testing => "testing",
            TaskState::Fixing => "fixing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub const ALL: [TaskState; 8] = [
        TaskState::Pending,
        TaskState::Analyzing,
        TaskState::Generating,
        TaskState::Building,
        TaskState::Testing,
        TaskState::Fixing,
        TaskState::Completed,
        TaskState::Failed,
    ];
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Unit of work owned by a single worker.
///
/// The container is referenced by id only; the sandbox owns the handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub language: String,
    pub state: TaskState,
    pub code: String,
    pub tests: String,
    /// Append-only.
    pub errors: Vec<String>,
    pub iterations: u32,
    pub container_id: Option<String>,
    pub project_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(description: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            language: language.into(),
            state: TaskState::Pending,
            code: String::new(),
            tests: String::new(),
            errors: Vec::new(),
            iterations: 0,
            container_id: None,
            project_path: None,
            created_at: Utc::now(),
            completed_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }

    /// Short id used in project and container names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }
}

// ---------------------------------------------------------------------------
// Command output
// ---------------------------------------------------------------------------

/// Result of running a command inside (or against) the container runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            success: false,
        }
    }

    /// Stderr if present, otherwise stdout. Used as the error text for the
    /// fix loop.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Fixing.is_terminal());
    }

    #[test]
    fn container_holding_states() {
        let holding: Vec<_> = TaskState::ALL
            .iter()
            .filter(|s| s.holds_container())
            .collect();
        assert_eq!(
            holding,
            vec![&TaskState::Building, &TaskState::Testing, &TaskState::Fixing]
        );
    }

    #[test]
    fn new_task_is_pending() {
        let task = Task::new("sum two ints", "python");
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.iterations, 0);
        assert!(task.errors.is_empty());
        assert_eq!(task.short_id().len(), 8);
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&TaskState::Generating).unwrap();
        assert_eq!(json, "\"generating\"");
    }

    #[test]
    fn diagnostics_prefers_stderr() {
        let mut out = ExecOutput::failed(1, "boom");
        out.stdout = "partial".into();
        assert_eq!(out.diagnostics(), "boom");
        out.stderr.clear();
        assert_eq!(out.diagnostics(), "partial");
    }
}
