//! Task definition and types

use crate::executor::tree::TreeHandle;
use crate::output::OutputBuffer;
use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TASK_ID_PREFIX: &str = "bash_";

/// Sentinel exit code for tasks that did not exit on their own
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// Unique identifier for a task (`bash_<uuid>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the wire form. Anything else cannot name a task.
    pub fn parse(s: &str) -> Option<Self> {
        let uuid = s.strip_prefix(TASK_ID_PREFIX)?;
        Uuid::parse_str(uuid).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", TASK_ID_PREFIX, self.0)
    }
}

/// Resources owned by a running task, released at its terminal transition
#[derive(Debug, Clone)]
pub struct TaskResources {
    /// OS process id of the launched shell
    pub pid: Option<u32>,

    /// Cooperative cancellation for the supervisor and anything waiting on it
    pub cancel: CancellationToken,

    /// Process group / Job Object covering the whole tree
    pub tree: Option<Arc<TreeHandle>>,

    /// Flips to true once the finishing worker is done with the task
    pub finished: watch::Receiver<bool>,
}

/// Terminal transition payload
#[derive(Debug, Clone)]
pub struct Terminal {
    pub status: TaskStatus,
    pub exit_code: i32,
    pub error_message: Option<String>,
    pub output: String,
}

impl Terminal {
    pub fn completed(output: String) -> Self {
        Self {
            status: TaskStatus::Completed,
            exit_code: 0,
            error_message: None,
            output,
        }
    }

    pub fn failed(exit_code: i32, error: impl Into<String>, output: String) -> Self {
        Self {
            status: TaskStatus::Failed,
            exit_code,
            error_message: Some(error.into()),
            output,
        }
    }

    pub fn killed(error: impl Into<String>, output: String) -> Self {
        Self {
            status: TaskStatus::Killed,
            exit_code: ABNORMAL_EXIT_CODE,
            error_message: Some(error.into()),
            output,
        }
    }
}

/// A tracked background task
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,

    /// Command text as submitted
    pub command: String,

    /// Optional caller-supplied label
    pub description: Option<String>,

    pub status: TaskStatus,

    pub start_time: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Authoritative once terminal
    pub output: String,

    /// Present iff terminal
    pub exit_code: Option<i32>,

    pub error_message: Option<String>,

    /// Durable output buffer; present iff running
    pub buffer: Option<Arc<OutputBuffer>>,

    /// Present while running, once the process has been launched
    pub resources: Option<TaskResources>,

    /// Set when a termination request has claimed this task
    pub terminating: bool,
}

impl Task {
    /// Create a running task that captures into `buffer`
    pub fn running(
        id: TaskId,
        command: impl Into<String>,
        description: Option<String>,
        buffer: Arc<OutputBuffer>,
    ) -> Self {
        Self {
            id,
            command: command.into(),
            description,
            status: TaskStatus::Running,
            start_time: Utc::now(),
            finished_at: None,
            output: String::new(),
            exit_code: None,
            error_message: None,
            buffer: Some(buffer),
            resources: None,
            terminating: false,
        }
    }

    /// Start time override (escalated tasks started before they were registered)
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_resources(mut self, resources: TaskResources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Log label
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.command)
    }

    /// Running → terminal. Drops the buffer reference and owned resources.
    ///
    /// A task claimed by a termination request always ends as Killed.
    pub(crate) fn finalize(&mut self, terminal: Terminal) {
        let terminal = if self.terminating && terminal.status != TaskStatus::Killed {
            Terminal::killed("Task was killed by user request", terminal.output)
        } else {
            terminal
        };

        self.status = terminal.status;
        self.exit_code = Some(terminal.exit_code);
        self.error_message = terminal.error_message;
        self.output = terminal.output;
        self.finished_at = Some(Utc::now());
        self.buffer = None;
        self.resources = None;
    }

    /// Copy of the caller-visible fields
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            command: self.command.clone(),
            description: self.description.clone(),
            status: self.status,
            start_time: self.start_time,
            finished_at: self.finished_at,
            output: self.output.clone(),
            exit_code: self.exit_code,
            error_message: self.error_message.clone(),
            buffer: self.buffer.clone(),
        }
    }

    /// Elapsed run time (until now if still running)
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.start_time
    }
}

/// Point-in-time copy of a task, safe to use without the registry lock
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    #[serde(serialize_with = "serialize_display")]
    pub id: TaskId,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Live buffer for running tasks
    #[serde(skip)]
    pub buffer: Option<Arc<OutputBuffer>>,
}

fn serialize_display<S: serde::Serializer>(id: &TaskId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let text = id.to_string();
        assert!(text.starts_with("bash_"));
        assert_eq!(TaskId::parse(&text), Some(id));
        assert_eq!(TaskId::parse("shell_1234"), None);
        assert_eq!(TaskId::parse("bash_not-a-uuid"), None);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn test_finalize_clears_running_fields() {
        let dir = tempdir().unwrap();
        let buffer = OutputBuffer::create_in(dir.path()).unwrap();
        let mut task = Task::running(TaskId::new(), "echo hi", None, buffer);
        assert!(task.buffer.is_some());
        assert!(task.exit_code.is_none());

        task.finalize(Terminal::completed("hi\n".into()));

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.exit_code, Some(0));
        assert!(task.buffer.is_none());
        assert!(task.finished_at.is_some());
        assert_eq!(task.output, "hi\n");
    }

    #[tokio::test]
    async fn test_terminating_task_finalizes_as_killed() {
        let dir = tempdir().unwrap();
        let buffer = OutputBuffer::create_in(dir.path()).unwrap();
        let mut task = Task::running(TaskId::new(), "sleep 10", Some("nap".into()), buffer);
        task.terminating = true;

        task.finalize(Terminal::failed(137, "exit status 137", "partial".into()));

        assert_eq!(task.status, TaskStatus::Killed);
        assert_eq!(task.exit_code, Some(ABNORMAL_EXIT_CODE));
        assert_eq!(task.output, "partial");
        assert_eq!(task.label(), "nap");
    }

    #[tokio::test]
    async fn test_snapshot_serializes_wire_id() {
        let dir = tempdir().unwrap();
        let buffer = OutputBuffer::create_in(dir.path()).unwrap();
        let task = Task::running(TaskId::new(), "echo hi", None, buffer);

        let json = serde_json::to_value(task.snapshot()).unwrap();
        assert_eq!(json["id"], task.id.to_string());
        assert_eq!(json["status"], "running");
        assert!(json.get("exitCode").is_none());
    }
}
