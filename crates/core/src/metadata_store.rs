// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The metadata store: single source of truth for Task, TaskRun, and
//! Worker records (spec.md §3). Redis holds ephemeral queue/stream/heartbeat
//! state instead; this trait covers only the durable side.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::{InstallKey, InstallKeyId, Task, TaskId, TaskRun, TaskRunId, Worker, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("task run not found: {0}")]
    TaskRunNotFound(TaskRunId),
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),
    #[error("install key not found: {0}")]
    InstallKeyNotFound(InstallKeyId),
}

/// Durable storage for the control plane's three primary entities. A real
/// deployment backs this with Postgres; `InMemoryMetadataStore` backs tests.
pub trait MetadataStore: Send + Sync {
    fn put_task(&self, task: Task) -> Result<(), StoreError>;
    fn get_task(&self, id: &TaskId) -> Result<Task, StoreError>;
    fn list_due_tasks(&self, now_ms: u64) -> Result<Vec<Task>, StoreError>;

    fn put_task_run(&self, run: TaskRun) -> Result<(), StoreError>;
    fn get_task_run(&self, id: &TaskRunId) -> Result<TaskRun, StoreError>;
    fn list_task_runs_for_worker(&self, worker: &WorkerId) -> Result<Vec<TaskRun>, StoreError>;
    fn list_non_terminal_task_runs(&self) -> Result<Vec<TaskRun>, StoreError>;
    /// Terminal runs whose outcome hasn't yet been folded into their Task's
    /// `success_count`/`failure_count` (reconcile loop's counter pass).
    fn list_uncounted_terminal_task_runs(&self) -> Result<Vec<TaskRun>, StoreError>;

    fn put_worker(&self, worker: Worker) -> Result<(), StoreError>;
    fn get_worker(&self, id: &WorkerId) -> Result<Worker, StoreError>;
    fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    fn put_install_key(&self, key: InstallKey) -> Result<(), StoreError>;
    fn find_install_key_by_value(&self, key_value: &str) -> Result<Option<InstallKey>, StoreError>;
}

/// In-memory implementation used by unit and integration tests across the
/// workspace (gated behind the `test-support` feature, mirroring the
/// teacher's own fake-over-mock convention).
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    task_runs: RwLock<HashMap<TaskRunId, TaskRun>>,
    workers: RwLock<HashMap<WorkerId, Worker>>,
    install_keys: RwLock<HashMap<InstallKeyId, InstallKey>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn put_task(&self, task: Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id.clone(), task);
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))
    }

    fn list_due_tasks(&self, now_ms: u64) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.is_due(now_ms))
            .cloned()
            .collect())
    }

    fn put_task_run(&self, run: TaskRun) -> Result<(), StoreError> {
        self.task_runs.write().insert(run.id.clone(), run);
        Ok(())
    }

    fn get_task_run(&self, id: &TaskRunId) -> Result<TaskRun, StoreError> {
        self.task_runs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskRunNotFound(id.clone()))
    }

    fn list_task_runs_for_worker(&self, worker: &WorkerId) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self
            .task_runs
            .read()
            .values()
            .filter(|r| r.assigned_worker.as_ref() == Some(worker))
            .cloned()
            .collect())
    }

    fn list_non_terminal_task_runs(&self) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self
            .task_runs
            .read()
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    fn list_uncounted_terminal_task_runs(&self) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self
            .task_runs
            .read()
            .values()
            .filter(|r| r.is_terminal() && !r.counted)
            .cloned()
            .collect())
    }

    fn put_worker(&self, worker: Worker) -> Result<(), StoreError> {
        self.workers.write().insert(worker.id.clone(), worker);
        Ok(())
    }

    fn get_worker(&self, id: &WorkerId) -> Result<Worker, StoreError> {
        self.workers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::WorkerNotFound(id.clone()))
    }

    fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self.workers.read().values().cloned().collect())
    }

    fn put_install_key(&self, key: InstallKey) -> Result<(), StoreError> {
        self.install_keys.write().insert(key.id.clone(), key);
        Ok(())
    }

    fn find_install_key_by_value(&self, key_value: &str) -> Result<Option<InstallKey>, StoreError> {
        Ok(self
            .install_keys
            .read()
            .values()
            .find(|k| k.key_value == key_value)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackoffFamily, ExecutionStrategy, RetryPolicy, ScheduleKind};

    fn sample_task(id: &str, due_at: u64) -> Task {
        Task {
            id: TaskId::new(id),
            project_id: "p-1".into(),
            schedule: ScheduleKind::Once,
            strategy: ExecutionStrategy::AnyCapable,
            timeout_secs: 60,
            retry_policy: RetryPolicy {
                max_attempts: 1,
                base_delay_secs: 1,
                max_delay_secs: 1,
                backoff: BackoffFamily::Fixed,
                jitter: false,
            },
            priority: 0,
            active: true,
            success_count: 0,
            failure_count: 0,
            next_run_at_ms: due_at,
        }
    }

    #[test]
    fn list_due_tasks_filters_on_active_and_next_run() {
        let store = InMemoryMetadataStore::new();
        store.put_task(sample_task("t-1", 100)).unwrap();
        store.put_task(sample_task("t-2", 5_000)).unwrap();

        let due = store.list_due_tasks(1_000).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id.as_str(), "t-1");
    }

    #[test]
    fn get_task_errors_when_missing() {
        let store = InMemoryMetadataStore::new();
        let err = store.get_task(&TaskId::new("nope")).unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(_)));
    }

    #[test]
    fn list_task_runs_for_worker_filters_by_assignment() {
        let store = InMemoryMetadataStore::new();
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.assigned_worker = Some(WorkerId::new("w-1"));
        store.put_task_run(run).unwrap();

        let runs = store.list_task_runs_for_worker(&WorkerId::new("w-1")).unwrap();
        assert_eq!(runs.len(), 1);
        let runs = store.list_task_runs_for_worker(&WorkerId::new("w-2")).unwrap();
        assert!(runs.is_empty());
    }
}
