//! Task state machine
//!
//! `Running → Completed | Failed | Killed`. 터미널 상태에서 나가는 전이는 없습니다.

use serde::{Deserialize, Serialize};

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Process is still running (or its exit has not been recorded yet)
    Running,

    /// Process exited with code 0
    Completed,

    /// Non-zero exit, launch failure, or the output could not be read back
    Failed,

    /// Explicitly terminated or cancelled
    Killed,
}

impl TaskStatus {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    /// Whether `self → next` is an allowed transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(self, TaskStatus::Running) && next.is_terminal()
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
