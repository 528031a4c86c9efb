// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduler loop (spec.md §4.2): turns due Tasks into QueuedTasks on
//! the resolved Worker's ready stream.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use antcode_backends::queue::QueueBackend;
use antcode_core::clock::Clock;
use antcode_core::metadata_store::{MetadataStore, StoreError};
use antcode_core::model::{
    DispatchStatus, PriorityBand, QueuedTaskPayload, ScheduleKind, Task, TaskId, TaskRun, TaskRunId,
};

use crate::election::Leadership;
use crate::worker_select::{resolve_worker, ResolutionError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a Task's project needs in order to be dispatched: where to fetch
/// the archive, the entry point inside it, and the expected hash. Resolved
/// per-project by whatever owns the project catalog (out of this crate's
/// scope); the scheduler only consumes the trait.
#[async_trait]
pub trait ProjectSource: Send + Sync {
    async fn resolve(&self, project_id: &str) -> Result<ProjectArtifact, String>;
}

#[derive(Debug, Clone)]
pub struct ProjectArtifact {
    pub project_type: String,
    pub entry_point: String,
    /// Pre-signed, valid for at least one hour from issuance (spec.md §6).
    pub download_url: String,
    pub expected_file_hash: String,
}

fn priority_band(priority: i32) -> PriorityBand {
    if priority >= 10 {
        PriorityBand::High
    } else if priority <= -10 {
        PriorityBand::Low
    } else {
        PriorityBand::Normal
    }
}

/// Next occurrence of a cron expression strictly after `after_ms`.
fn next_cron_occurrence(expression: &str, after_ms: u64) -> Result<u64, String> {
    let schedule = cron::Schedule::from_str(expression).map_err(|e| e.to_string())?;
    let after = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(after_ms as i64)
        .ok_or_else(|| "next_run_at_ms out of chrono's representable range".to_string())?;
    schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis() as u64)
        .ok_or_else(|| "cron expression has no future occurrence".to_string())
}

/// Releases a Task's in-flight guard when a `dispatch_one` call returns, on
/// every exit path, so a Task that fails artifact/worker resolution is
/// eligible for dispatch again on the next tick instead of being stuck.
struct InFlightGuard<'a> {
    in_flight: &'a parking_lot::Mutex<HashSet<TaskId>>,
    task_id: TaskId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.task_id);
    }
}

pub struct SchedulerLoop<S, Q, P, C> {
    store: Arc<S>,
    queue: Arc<Q>,
    projects: Arc<P>,
    clock: Arc<C>,
    leadership: Leadership,
    tick_interval: Duration,
    download_url_ttl_secs: u64,
    /// Tasks currently being dispatched by this process, so two overlapping
    /// ticks (a slow project/worker resolution outlasting `tick_interval`)
    /// never both try to dispatch the same Task (spec.md §4.2: "idempotent
    /// over ticks"). The authoritative guard is the store: a Task with a
    /// non-terminal TaskRun is never redispatched regardless of this set.
    in_flight: parking_lot::Mutex<HashSet<TaskId>>,
}

impl<S, Q, P, C> SchedulerLoop<S, Q, P, C>
where
    S: MetadataStore + 'static,
    Q: QueueBackend + 'static,
    P: ProjectSource + 'static,
    C: Clock + 'static,
{
    pub fn new(
        store: Arc<S>,
        queue: Arc<Q>,
        projects: Arc<P>,
        clock: Arc<C>,
        leadership: Leadership,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            projects,
            clock,
            leadership,
            tick_interval,
            download_url_ttl_secs: 3_600,
            in_flight: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self) {
        loop {
            if self.leadership.is_leader() {
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "scheduler tick failed");
                }
            }
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    /// One scheduling pass: enumerate due Tasks (priority desc, then
    /// `next_run_at_ms` asc) and dispatch each in order.
    async fn tick(&self) -> Result<(), SchedulerError> {
        let now_ms = self.clock.epoch_ms();
        let mut due = self.store.list_due_tasks(now_ms)?;
        due.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.next_run_at_ms.cmp(&b.next_run_at_ms)));

        for task in due {
            if let Err(e) = self.dispatch_one(&task, now_ms).await {
                warn!(task_id = %task.id, error = %e, "failed to dispatch due task");
            }
        }
        Ok(())
    }

    async fn dispatch_one(&self, task: &Task, now_ms: u64) -> Result<(), SchedulerError> {
        let all_runs = self.store.list_non_terminal_task_runs()?;
        if all_runs.iter().any(|r| r.task_id == task.id) {
            return Ok(());
        }
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(task.id.clone()) {
                return Ok(());
            }
        }
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            task_id: task.id.clone(),
        };

        let run_id = TaskRunId::new(uuid::Uuid::new_v4().to_string());

        let artifact = match self.projects.resolve(&task.project_id).await {
            Ok(a) => a,
            Err(reason) => {
                warn!(task_id = %task.id, %reason, "no project artifact for due task");
                return Ok(());
            }
        };

        let workers = self.store.list_workers()?;
        let worker_id = match resolve_worker(&task.strategy, &workers, &all_runs, &artifact.project_type) {
            Ok(id) => id,
            Err(ResolutionError::BoundWorkerOffline(id)) => {
                info!(task_id = %task.id, worker_id = %id, "bound worker offline, deferring to retry loop");
                return Ok(());
            }
            Err(ResolutionError::NoCapableWorker) => {
                info!(task_id = %task.id, "no capable worker online, deferring to retry loop");
                return Ok(());
            }
        };

        let mut run = TaskRun::new(run_id.clone(), task.id.clone(), now_ms);
        run.assigned_worker = Some(worker_id.clone());

        let payload = QueuedTaskPayload {
            run_id: run_id.clone(),
            project_id: task.project_id.clone(),
            project_type: artifact.project_type.clone(),
            entry_point: artifact.entry_point.clone(),
            download_url: artifact.download_url.clone(),
            expected_file_hash: artifact.expected_file_hash.clone(),
            timeout_secs: task.timeout_secs,
            env_vars: BTreeMap::new(),
        };
        let payload_json = serde_json::to_value(&payload).map_err(|e| {
            warn!(task_id = %task.id, error = %e, "failed to serialize queued task payload");
            e
        });

        let Ok(payload_json) = payload_json else {
            run.apply_dispatch_transition(DispatchStatus::Failed, now_ms);
            self.store.put_task_run(run)?;
            return Ok(());
        };

        let mut enqueue_err = None;
        let mut dispatched = false;
        for attempt in 0..3 {
            match self
                .queue
                .enqueue(worker_id.as_str(), vec![payload_json.clone()], task.priority)
                .await
            {
                Ok(ids) => {
                    run.apply_dispatch_transition(DispatchStatus::Dispatched, now_ms);
                    info!(
                        task_id = %task.id,
                        run_id = %run_id,
                        worker_id = %worker_id,
                        stream_id = ?ids.first(),
                        priority_band = ?priority_band(task.priority),
                        "dispatched task run"
                    );
                    enqueue_err = None;
                    dispatched = true;
                    break;
                }
                Err(e) => {
                    enqueue_err = Some(e.to_string());
                    tokio::time::sleep(Duration::from_millis(50 * (attempt + 1))).await;
                }
            }
        }
        if let Some(reason) = enqueue_err {
            warn!(task_id = %task.id, %reason, "enqueue failed after retries, deferring to retry loop");
            run.apply_dispatch_transition(DispatchStatus::Failed, now_ms);
        }

        self.store.put_task_run(run)?;

        if dispatched {
            self.advance_schedule(task, now_ms)?;
        }
        Ok(())
    }

    /// Moves a successfully dispatched Task past `now_ms` so the next
    /// `list_due_tasks` call doesn't pick it straight back up: `Once` tasks
    /// are deactivated, `Interval`/`Cron` tasks get their next occurrence.
    fn advance_schedule(&self, task: &Task, now_ms: u64) -> Result<(), SchedulerError> {
        let mut updated = task.clone();
        match &task.schedule {
            ScheduleKind::Once => updated.active = false,
            ScheduleKind::Interval { seconds } => {
                updated.next_run_at_ms = now_ms + seconds * 1000;
            }
            ScheduleKind::Cron { expression } => match next_cron_occurrence(expression, now_ms) {
                Ok(next_ms) => updated.next_run_at_ms = next_ms,
                Err(reason) => {
                    warn!(task_id = %task.id, %reason, "cron task has no future occurrence, deactivating");
                    updated.active = false;
                }
            },
        }
        self.store.put_task(updated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::clock::FakeClock;
    use antcode_core::metadata_store::InMemoryMetadataStore;
    use antcode_core::model::{
        BackoffFamily, ExecutionStrategy, MetricsSnapshot, RetryPolicy, ScheduleKind, TaskId,
        TransportMode, Worker, WorkerId, WorkerStatus,
    };
    use antcode_backends::memory::InMemoryQueueBackend;

    struct StaticProjectSource;

    #[async_trait]
    impl ProjectSource for StaticProjectSource {
        async fn resolve(&self, project_id: &str) -> Result<ProjectArtifact, String> {
            Ok(ProjectArtifact {
                project_type: "code".into(),
                entry_point: "main.py".into(),
                download_url: format!("https://artifacts.test/{project_id}"),
                expected_file_hash: "deadbeef".into(),
            })
        }
    }

    #[tokio::test]
    async fn dispatch_one_marks_run_dispatched_on_success() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store
            .put_worker(Worker {
                id: WorkerId::new("w-1"),
                name: "w-1".into(),
                host: "10.0.0.1".into(),
                port: 7000,
                region: "us-east".into(),
                transport: TransportMode::Direct,
                api_key: None,
                secret: None,
                capabilities: ["code".to_string()].into_iter().collect(),
                status: WorkerStatus::Online,
                last_heartbeat_ms: Some(0),
                metrics: MetricsSnapshot::default(),
                os: "linux".into(),
                arch: "x86_64".into(),
                streams: vec![],
            })
            .unwrap();

        let queue = Arc::new(InMemoryQueueBackend::new(5));
        let projects = Arc::new(StaticProjectSource);
        let clock = Arc::new(FakeClock::new(1_000));

        let task = Task {
            id: TaskId::new("t-1"),
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
            next_run_at_ms: 0,
        };

        let scheduler = SchedulerLoop::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            projects,
            clock,
            Leadership::for_tests(true, 7),
            Duration::from_secs(1),
        );
        scheduler.dispatch_one(&task, 1_000).await.unwrap();

        let runs = store.list_non_terminal_task_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].dispatch_status, DispatchStatus::Dispatched);
        assert_eq!(runs[0].assigned_worker, Some(WorkerId::new("w-1")));

        let stats = queue.stats("w-1").await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    fn worker(id: &str) -> Worker {
        Worker {
            id: WorkerId::new(id),
            name: id.into(),
            host: "10.0.0.1".into(),
            port: 7000,
            region: "us-east".into(),
            transport: TransportMode::Direct,
            api_key: None,
            secret: None,
            capabilities: ["code".to_string()].into_iter().collect(),
            status: WorkerStatus::Online,
            last_heartbeat_ms: Some(0),
            metrics: MetricsSnapshot::default(),
            os: "linux".into(),
            arch: "x86_64".into(),
            streams: vec![],
        }
    }

    fn once_task() -> Task {
        Task {
            id: TaskId::new("t-1"),
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
            next_run_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn dispatch_one_deactivates_a_once_task_on_success() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_worker(worker("w-1")).unwrap();
        let queue = Arc::new(InMemoryQueueBackend::new(5));
        let scheduler = SchedulerLoop::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::new(StaticProjectSource),
            Arc::new(FakeClock::new(1_000)),
            Leadership::for_tests(true, 7),
            Duration::from_secs(1),
        );

        scheduler.dispatch_one(&once_task(), 1_000).await.unwrap();

        let updated = store.get_task(&TaskId::new("t-1")).unwrap();
        assert!(!updated.active);
    }

    #[tokio::test]
    async fn dispatch_one_advances_an_interval_task_past_now() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_worker(worker("w-1")).unwrap();
        let queue = Arc::new(InMemoryQueueBackend::new(5));
        let scheduler = SchedulerLoop::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::new(StaticProjectSource),
            Arc::new(FakeClock::new(1_000)),
            Leadership::for_tests(true, 7),
            Duration::from_secs(1),
        );
        let task = Task {
            schedule: ScheduleKind::Interval { seconds: 30 },
            ..once_task()
        };

        scheduler.dispatch_one(&task, 1_000).await.unwrap();

        let updated = store.get_task(&TaskId::new("t-1")).unwrap();
        assert_eq!(updated.next_run_at_ms, 1_000 + 30_000);
    }

    #[tokio::test]
    async fn tick_does_not_redispatch_a_task_with_a_non_terminal_run() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_worker(worker("w-1")).unwrap();
        // Deliberately keep the task `active` with a past `next_run_at_ms`
        // (as it would be mid-flight before the scheduler advances it) and
        // plant an already-dispatched, non-terminal run for it.
        store.put_task(once_task()).unwrap();
        let mut existing = TaskRun::new(TaskRunId::new("r-existing"), TaskId::new("t-1"), 500);
        existing.apply_dispatch_transition(DispatchStatus::Dispatched, 500);
        store.put_task_run(existing).unwrap();

        let queue = Arc::new(InMemoryQueueBackend::new(5));
        let scheduler = SchedulerLoop::new(
            store,
            Arc::clone(&queue),
            Arc::new(StaticProjectSource),
            Arc::new(FakeClock::new(1_000)),
            Leadership::for_tests(true, 7),
            Duration::from_secs(1),
        );

        scheduler.tick().await.unwrap();

        let stats = queue.stats("w-1").await.unwrap();
        assert_eq!(stats.pending, 0);
    }
}
