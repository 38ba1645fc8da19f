//! Background Task Registry - tracked tasks and their lifecycle transitions
//!
//! One coarse `RwLock` guards the map. Every method copies what it needs and
//! releases the lock before returning; callers do file/process I/O on the
//! copies, never under the lock.

use crate::state::TaskStatus;
use crate::task::{Task, TaskId, TaskResources, TaskSnapshot, Terminal};
use forgeshell_foundation::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of claiming a task for termination
#[derive(Debug)]
pub enum TerminationClaim {
    /// Already terminal; the record has been removed
    Finished(TaskSnapshot),

    /// Still running; the record is marked and the caller owns teardown
    Running {
        snapshot: TaskSnapshot,
        resources: Option<TaskResources>,
    },
}

/// Concurrent-safe store of background tasks
pub struct BackgroundTaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
    capacity: usize,
}

impl BackgroundTaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a new task, enforcing capacity
    pub async fn create(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.len() >= self.capacity {
            return Err(Error::Capacity(format!(
                "maximum background tasks limit reached ({}/{})",
                tasks.len(),
                self.capacity
            )));
        }
        if tasks.contains_key(&task.id) {
            return Err(Error::Internal(format!("duplicate task id: {}", task.id)));
        }

        info!("Created background task {}: {}", task.id, task.label());
        tasks.insert(task.id, task);
        Ok(())
    }

    /// Insert a foreground task that outlived its timeout
    ///
    /// The process is already running, so capacity is reported but not enforced.
    pub async fn insert_escalated(&self, task: Task) {
        let mut tasks = self.tasks.write().await;
        if tasks.len() >= self.capacity {
            warn!(
                "Escalating {} beyond background capacity ({}/{})",
                task.id,
                tasks.len(),
                self.capacity
            );
        }

        info!("Escalated task {} to background: {}", task.id, task.label());
        tasks.insert(task.id, task);
    }

    /// Attach launch resources to a created task
    ///
    /// Returns false if a termination request already claimed the task.
    pub async fn attach(&self, id: TaskId, resources: TaskResources) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| Error::task_not_found(id))?;

        if !task.status.is_running() {
            return Err(Error::Task(format!("task {} is no longer running", id)));
        }
        task.resources = Some(resources);
        Ok(!task.terminating)
    }

    pub async fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(Task::snapshot)
            .ok_or_else(|| Error::task_not_found(id))
    }

    /// Perform the single Running → terminal transition
    ///
    /// Fails with NotFound once the record has been removed by termination.
    pub async fn finalize_terminal(&self, id: TaskId, terminal: Terminal) -> Result<TaskStatus> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| Error::task_not_found(id))?;

        if !task.status.can_transition_to(terminal.status) {
            return Err(Error::Task(format!(
                "task {} already finalized as {}",
                id, task.status
            )));
        }

        task.finalize(terminal);
        info!(
            "Task {} finished: {} (exit {:?}, {} ms)",
            id,
            task.status,
            task.exit_code,
            task.duration().num_milliseconds()
        );
        Ok(task.status)
    }

    /// Claim a task for termination
    ///
    /// Terminal tasks are removed right away. Running tasks stay registered,
    /// marked, until the caller finishes teardown and calls `remove`. A task
    /// already claimed by another request reports NotFound.
    pub async fn claim_termination(&self, id: TaskId) -> Result<TerminationClaim> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or_else(|| Error::task_not_found(id))?;

        if task.terminating {
            return Err(Error::task_not_found(id));
        }

        if task.status.is_terminal() {
            let snapshot = task.snapshot();
            tasks.remove(&id);
            debug!("Removed finished task {} ({})", id, snapshot.status);
            return Ok(TerminationClaim::Finished(snapshot));
        }

        task.terminating = true;
        Ok(TerminationClaim::Running {
            snapshot: task.snapshot(),
            resources: task.resources.clone(),
        })
    }

    /// Delete a record, returning its last state
    pub async fn remove(&self, id: TaskId) -> Option<TaskSnapshot> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.remove(&id).map(|task| task.snapshot());
        if removed.is_some() {
            debug!("Removed task {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    pub async fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().await.contains_key(&id)
    }

    /// Snapshots of all tasks, oldest first
    pub async fn list(&self) -> Vec<TaskSnapshot> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<_> = tasks.values().map(Task::snapshot).collect();
        all.sort_by_key(|s| s.start_time);
        all
    }

    pub async fn running_count(&self) -> usize {
        let tasks = self.tasks.read().await;
        tasks.values().filter(|t| t.status.is_running()).count()
    }

    pub async fn running_ids(&self) -> Vec<TaskId> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| t.status.is_running())
            .map(|t| t.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputBuffer;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn running_task(dir: &TempDir) -> Task {
        let buffer = OutputBuffer::create_in(dir.path()).unwrap();
        Task::running(TaskId::new(), "sleep 5", None, buffer)
    }

    #[tokio::test]
    async fn test_create_respects_capacity() {
        let dir = tempdir().unwrap();
        let registry = BackgroundTaskRegistry::new(2);

        registry.create(running_task(&dir)).await.unwrap();
        registry.create(running_task(&dir)).await.unwrap();
        let err = registry.create(running_task(&dir)).await.unwrap_err();

        assert!(matches!(err, Error::Capacity(_)));
        assert!(err.to_string().contains("(2/2)"));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_escalation_bypasses_capacity() {
        let dir = tempdir().unwrap();
        let registry = BackgroundTaskRegistry::new(1);

        registry.create(running_task(&dir)).await.unwrap();
        registry.insert_escalated(running_task(&dir)).await;

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.running_count().await, 2);
    }

    #[tokio::test]
    async fn test_finalize_happens_once() {
        let dir = tempdir().unwrap();
        let registry = BackgroundTaskRegistry::new(4);
        let task = running_task(&dir);
        let id = task.id;
        registry.create(task).await.unwrap();

        let status = registry
            .finalize_terminal(id, Terminal::completed("done\n".into()))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let again = registry
            .finalize_terminal(id, Terminal::killed("late", String::new()))
            .await;
        assert!(matches!(again, Err(Error::Task(_))));

        let snapshot = registry.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.exit_code, Some(0));
        assert!(snapshot.buffer.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let dir = tempdir().unwrap();
        let registry = BackgroundTaskRegistry::new(4);
        let task = running_task(&dir);
        let id = task.id;
        registry.create(task).await.unwrap();

        let before = registry.snapshot(id).await.unwrap();
        registry
            .finalize_terminal(id, Terminal::failed(2, "exit status 2", "oops".into()))
            .await
            .unwrap();

        assert_eq!(before.status, TaskStatus::Running);
        assert!(before.exit_code.is_none());
        assert_eq!(registry.snapshot(id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_claim_finished_task_removes_it() {
        let dir = tempdir().unwrap();
        let registry = BackgroundTaskRegistry::new(4);
        let task = running_task(&dir);
        let id = task.id;
        registry.create(task).await.unwrap();
        registry
            .finalize_terminal(id, Terminal::completed(String::new()))
            .await
            .unwrap();

        let claim = registry.claim_termination(id).await.unwrap();
        assert!(matches!(claim, TerminationClaim::Finished(_)));
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.claim_termination(id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_claimed_running_task_finalizes_as_killed() {
        let dir = tempdir().unwrap();
        let registry = BackgroundTaskRegistry::new(4);
        let task = running_task(&dir);
        let id = task.id;
        registry.create(task).await.unwrap();

        let claim = registry.claim_termination(id).await.unwrap();
        assert!(matches!(claim, TerminationClaim::Running { resources: None, .. }));
        assert!(matches!(
            registry.claim_termination(id).await,
            Err(Error::NotFound(_))
        ));

        let status = registry
            .finalize_terminal(id, Terminal::completed("partial".into()))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Killed);

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.output, "partial");
        assert!(registry.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let registry = BackgroundTaskRegistry::new(4);
        let err = registry.snapshot(TaskId::new()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_yield_distinct_ids() {
        let dir = Arc::new(tempdir().unwrap());
        let registry = Arc::new(BackgroundTaskRegistry::new(50));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let dir = Arc::clone(&dir);
                tokio::spawn(async move {
                    let task = running_task(&dir);
                    let id = task.id;
                    registry.create(task).await.map(|_| id)
                })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 20);
        assert_eq!(registry.len().await, 20);
    }
}
