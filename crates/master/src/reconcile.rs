// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The reconcile loop (spec.md §4.3): four bounded repair passes run each
//! tick under leader authority.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use antcode_core::clock::Clock;
use antcode_core::metadata_store::{MetadataStore, StoreError};
use antcode_core::model::{DispatchStatus, OverallStatus, RuntimeStatus, Worker, WorkerStatus};

use crate::election::Leadership;
use crate::retry::RetrySink;

const ZOMBIE_THRESHOLD_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ReconcileLoop<S, R, C> {
    store: Arc<S>,
    retry: Arc<R>,
    clock: Arc<C>,
    leadership: Leadership,
    tick_interval: Duration,
    heartbeat_offline_threshold_secs: u64,
}

impl<S, R, C> ReconcileLoop<S, R, C>
where
    S: MetadataStore + 'static,
    R: RetrySink + 'static,
    C: Clock + 'static,
{
    pub fn new(
        store: Arc<S>,
        retry: Arc<R>,
        clock: Arc<C>,
        leadership: Leadership,
        tick_interval: Duration,
        heartbeat_offline_threshold_secs: u64,
    ) -> Self {
        Self {
            store,
            retry,
            clock,
            leadership,
            tick_interval,
            heartbeat_offline_threshold_secs,
        }
    }

    pub async fn run(self) {
        loop {
            if self.leadership.is_leader() {
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "reconcile tick failed");
                }
            }
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    async fn tick(&self) -> Result<(), ReconcileError> {
        let now_ms = self.clock.epoch_ms();
        self.detect_timeouts(now_ms)?;
        self.handle_failed_workers(now_ms)?;
        self.repair_inconsistent_state(now_ms)?;
        self.clean_up_zombies(now_ms)?;
        self.apply_result_counters()?;
        Ok(())
    }

    /// 1. TaskRuns running past `task.timeout` become `timeout`.
    fn detect_timeouts(&self, now_ms: u64) -> Result<(), ReconcileError> {
        for mut run in self.store.list_non_terminal_task_runs()? {
            if run.runtime_status != RuntimeStatus::Running {
                continue;
            }
            let Some(start) = run.start_time_ms else { continue };
            let Ok(task) = self.store.get_task(&run.task_id) else { continue };
            if now_ms.saturating_sub(start) > task.timeout_secs * 1000 {
                run.error_message = Some("task execution timed out".into());
                if run.apply_runtime_transition(RuntimeStatus::Timeout, now_ms) {
                    info!(run_id = %run.id, "reconcile: transitioned overdue run to timeout");
                    self.retry.submit(run.clone());
                }
                self.store.put_task_run(run)?;
            }
        }
        Ok(())
    }

    /// 2. Workers whose heartbeat is stale are marked offline; their
    /// non-terminal runs fail with "worker disconnected".
    fn handle_failed_workers(&self, now_ms: u64) -> Result<(), ReconcileError> {
        for worker in self.store.list_workers()? {
            if worker.status != WorkerStatus::Online {
                continue;
            }
            if worker.is_heartbeat_fresh(now_ms, self.heartbeat_offline_threshold_secs) {
                continue;
            }
            warn!(worker_id = %worker.id, "reconcile: worker heartbeat expired, marking offline");
            let offline = Worker {
                status: WorkerStatus::Offline,
                ..worker.clone()
            };
            self.store.put_worker(offline)?;

            for mut run in self.store.list_task_runs_for_worker(&worker.id)? {
                if run.is_terminal() {
                    continue;
                }
                run.error_message = Some("worker disconnected".into());
                if run.apply_runtime_transition(RuntimeStatus::Failed, now_ms) {
                    self.retry.submit(run.clone());
                }
                self.store.put_task_run(run)?;
            }
        }
        Ok(())
    }

    /// 3. A run left with `runtime_status = running` but `end_time` set is
    /// repaired by inspecting whether an error was recorded.
    fn repair_inconsistent_state(&self, now_ms: u64) -> Result<(), ReconcileError> {
        for mut run in self.store.list_non_terminal_task_runs()? {
            if run.runtime_status != RuntimeStatus::Running || run.end_time_ms.is_none() {
                continue;
            }
            let target = if run.error_message.is_some() {
                RuntimeStatus::Failed
            } else {
                RuntimeStatus::Success
            };
            warn!(run_id = %run.id, ?target, "reconcile: repairing inconsistent run state");
            run.apply_runtime_transition(target, now_ms);
            self.store.put_task_run(run)?;
        }
        Ok(())
    }

    /// 4. Runs stuck `pending` for over 24h are failed outright, no retry.
    fn clean_up_zombies(&self, now_ms: u64) -> Result<(), ReconcileError> {
        for mut run in self.store.list_non_terminal_task_runs()? {
            if run.dispatch_status != DispatchStatus::Pending {
                continue;
            }
            if now_ms.saturating_sub(run.created_at_ms) <= ZOMBIE_THRESHOLD_MS {
                continue;
            }
            run.error_message = Some("never scheduled".into());
            run.apply_dispatch_transition(DispatchStatus::Failed, now_ms);
            self.store.put_task_run(run)?;
        }
        Ok(())
    }

    /// 5. Folds each newly-terminal run's outcome into its Task's
    /// `success_count`/`failure_count` (spec.md §3; SPEC_FULL.md §9: the
    /// reconcile loop is the single writer of both counters). Runs already
    /// marked `counted` are skipped, so a crash between a run going
    /// terminal and this pass self-heals on the next tick.
    fn apply_result_counters(&self) -> Result<(), ReconcileError> {
        for mut run in self.store.list_uncounted_terminal_task_runs()? {
            if let Ok(mut task) = self.store.get_task(&run.task_id) {
                match run.overall_status() {
                    OverallStatus::Success => task.success_count += 1,
                    OverallStatus::Failed | OverallStatus::Timeout => task.failure_count += 1,
                    OverallStatus::Cancelled | OverallStatus::Skipped => {}
                    OverallStatus::Pending | OverallStatus::Dispatched | OverallStatus::Running => {
                        unreachable!("list_uncounted_terminal_task_runs only returns terminal runs")
                    }
                }
                self.store.put_task(task)?;
            }
            run.counted = true;
            self.store.put_task_run(run)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::clock::FakeClock;
    use antcode_core::metadata_store::InMemoryMetadataStore;
    use antcode_core::model::{
        BackoffFamily, ExecutionStrategy, MetricsSnapshot, RetryPolicy, ScheduleKind, Task, TaskId,
        TaskRun, TaskRunId, TransportMode, WorkerId,
    };
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingRetrySink(Mutex<Vec<TaskRunId>>);

    impl RetrySink for CollectingRetrySink {
        fn submit(&self, run: TaskRun) {
            self.0.lock().push(run.id);
        }
    }

    fn task(id: &str, timeout_secs: u64) -> Task {
        Task {
            id: TaskId::new(id),
            project_id: "p-1".into(),
            schedule: ScheduleKind::Once,
            strategy: ExecutionStrategy::AnyCapable,
            timeout_secs,
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
    async fn detect_timeouts_transitions_overdue_running_runs() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_task(task("t-1", 5)).unwrap();
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.apply_dispatch_transition(DispatchStatus::Dispatched, 0);
        run.apply_runtime_transition(RuntimeStatus::Running, 0);
        run.start_time_ms = Some(0);
        store.put_task_run(run).unwrap();

        let retry = Arc::new(CollectingRetrySink::default());
        let clock = Arc::new(FakeClock::new(10_000));
        let loop_ = ReconcileLoop::new(
            Arc::clone(&store),
            Arc::clone(&retry),
            clock,
            Leadership::for_tests(true, 1),
            Duration::from_secs(1),
            60,
        );
        loop_.detect_timeouts(10_000).unwrap();

        let updated = store.get_task_run(&TaskRunId::new("r-1")).unwrap();
        assert_eq!(updated.runtime_status, RuntimeStatus::Timeout);
        assert_eq!(retry.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn handle_failed_workers_fails_non_terminal_runs() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store
            .put_worker(antcode_core::model::Worker {
                id: WorkerId::new("w-1"),
                name: "w-1".into(),
                host: "10.0.0.1".into(),
                port: 7000,
                region: "us-east".into(),
                transport: TransportMode::Direct,
                api_key: None,
                secret: None,
                capabilities: Default::default(),
                status: antcode_core::model::WorkerStatus::Online,
                last_heartbeat_ms: Some(0),
                metrics: MetricsSnapshot::default(),
                os: "linux".into(),
                arch: "x86_64".into(),
                streams: vec![],
            })
            .unwrap();
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.assigned_worker = Some(WorkerId::new("w-1"));
        run.apply_dispatch_transition(DispatchStatus::Dispatched, 0);
        run.apply_runtime_transition(RuntimeStatus::Running, 0);
        store.put_task_run(run).unwrap();

        let retry = Arc::new(CollectingRetrySink::default());
        let clock = Arc::new(FakeClock::new(100_000));
        let loop_ = ReconcileLoop::new(
            Arc::clone(&store),
            Arc::clone(&retry),
            clock,
            Leadership::for_tests(true, 1),
            Duration::from_secs(1),
            60,
        );
        loop_.handle_failed_workers(100_000).unwrap();

        let updated = store.get_task_run(&TaskRunId::new("r-1")).unwrap();
        assert_eq!(updated.runtime_status, RuntimeStatus::Failed);
        assert_eq!(updated.error_message.as_deref(), Some("worker disconnected"));
        let worker = store.get_worker(&WorkerId::new("w-1")).unwrap();
        assert_eq!(worker.status, antcode_core::model::WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn zombie_cleanup_fails_stale_pending_runs() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.start_time_ms = Some(0);
        store.put_task_run(run).unwrap();

        let retry = Arc::new(CollectingRetrySink::default());
        let clock = Arc::new(FakeClock::new(ZOMBIE_THRESHOLD_MS + 1));
        let loop_ = ReconcileLoop::new(
            Arc::clone(&store),
            retry,
            clock,
            Leadership::for_tests(true, 1),
            Duration::from_secs(1),
            60,
        );
        loop_.clean_up_zombies(ZOMBIE_THRESHOLD_MS + 1).unwrap();

        let updated = store.get_task_run(&TaskRunId::new("r-1")).unwrap();
        assert_eq!(updated.dispatch_status, DispatchStatus::Failed);
        assert_eq!(updated.error_message.as_deref(), Some("never scheduled"));
    }

    #[tokio::test]
    async fn apply_result_counters_bumps_success_count_once() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_task(task("t-1", 60)).unwrap();
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.apply_dispatch_transition(DispatchStatus::Dispatched, 0);
        run.apply_runtime_transition(RuntimeStatus::Success, 10);
        store.put_task_run(run).unwrap();

        let retry = Arc::new(CollectingRetrySink::default());
        let loop_ = ReconcileLoop::new(
            Arc::clone(&store),
            retry,
            Arc::new(FakeClock::new(10)),
            Leadership::for_tests(true, 1),
            Duration::from_secs(1),
            60,
        );

        loop_.apply_result_counters().unwrap();
        assert_eq!(store.get_task(&TaskId::new("t-1")).unwrap().success_count, 1);
        let counted = store.get_task_run(&TaskRunId::new("r-1")).unwrap();
        assert!(counted.counted);

        // A second pass must not double-count an already-counted run.
        loop_.apply_result_counters().unwrap();
        assert_eq!(store.get_task(&TaskId::new("t-1")).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn apply_result_counters_bumps_failure_count_for_failed_runs() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_task(task("t-1", 60)).unwrap();
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.apply_dispatch_transition(DispatchStatus::Dispatched, 0);
        run.apply_runtime_transition(RuntimeStatus::Failed, 10);
        store.put_task_run(run).unwrap();

        let retry = Arc::new(CollectingRetrySink::default());
        let loop_ = ReconcileLoop::new(
            Arc::clone(&store),
            retry,
            Arc::new(FakeClock::new(10)),
            Leadership::for_tests(true, 1),
            Duration::from_secs(1),
            60,
        );

        loop_.apply_result_counters().unwrap();
        assert_eq!(store.get_task(&TaskId::new("t-1")).unwrap().failure_count, 1);
    }
}
