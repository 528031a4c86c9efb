// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The retry loop (spec.md §4.4): decides whether a failed TaskRun gets
//! another attempt, and if so, at what delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use antcode_core::clock::Clock;
use antcode_core::metadata_store::{MetadataStore, StoreError};
use antcode_core::model::{RetryPolicy, Task, TaskId, TaskRun};

use crate::alert::{AlertSink, CompensationHandler, RetryExhaustedAlert};
use crate::election::Leadership;

/// Error kinds that never get retried, short-circuiting straight to
/// compensation (spec.md §4.4, §7).
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "authentication",
    "unauthorized",
    "permission",
    "invalid configuration",
];

fn is_retryable(error_message: Option<&str>) -> bool {
    match error_message {
        None => true,
        Some(msg) => {
            let lower = msg.to_lowercase();
            !NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
        }
    }
}

/// Hands a failed run to the retry loop without blocking the caller (the
/// reconcile loop's detection passes are synchronous). Backed by an
/// unbounded channel the retry loop drains on its own tick.
#[derive(Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<TaskRun>,
}

pub trait RetrySink: Send + Sync {
    fn submit(&self, run: TaskRun);
}

impl RetrySink for RetryHandle {
    fn submit(&self, run: TaskRun) {
        if self.tx.send(run).is_err() {
            warn!("retry loop channel closed, dropping failed run");
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct DelayedEntry {
    run: TaskRun,
    due_at_ms: u64,
}

/// Computes the backoff delay for a given policy and retry index, applying
/// jitter if enabled. Split out from `RetryPolicy::base_delay_for` (which is
/// jitter-free and deterministic) so jitter stays a loop concern, not a
/// model concern.
fn delayed_secs(policy: &RetryPolicy, retry_index: u32) -> u64 {
    let base = policy.base_delay_for(retry_index);
    if !policy.jitter || base == 0 {
        return base;
    }
    let jitter_range = (base as f64 * 0.1).round() as i64;
    if jitter_range == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    (base as i64 + offset).max(0) as u64
}

pub struct RetryLoop<S, A, C> {
    store: Arc<S>,
    alerts: Arc<A>,
    clock: Arc<C>,
    leadership: Leadership,
    tick_interval: Duration,
    compensation_handlers: HashMap<String, Arc<dyn CompensationHandler>>,
    delayed: parking_lot::Mutex<Vec<DelayedEntry>>,
    inbox: parking_lot::Mutex<mpsc::UnboundedReceiver<TaskRun>>,
}

impl<S, A, C> RetryLoop<S, A, C>
where
    S: MetadataStore + 'static,
    A: AlertSink + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, alerts: Arc<A>, clock: Arc<C>, leadership: Leadership, tick_interval: Duration) -> (Self, RetryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let loop_ = Self {
            store,
            alerts,
            clock,
            leadership,
            tick_interval,
            compensation_handlers: HashMap::new(),
            delayed: parking_lot::Mutex::new(Vec::new()),
            inbox: parking_lot::Mutex::new(rx),
        };
        (loop_, RetryHandle { tx })
    }

    pub fn register_compensation(&mut self, project_type: impl Into<String>, handler: Arc<dyn CompensationHandler>) {
        self.compensation_handlers.insert(project_type.into(), handler);
    }

    /// Decide the fate of one failed run: retry (enqueued into the delayed
    /// work queue) or compensate.
    pub async fn consider(&self, run: TaskRun) -> Result<(), RetryError> {
        let task = self.store.get_task(&run.task_id)?;

        if !is_retryable(run.error_message.as_deref()) {
            info!(run_id = %run.id, "retry: non-retryable error class, compensating");
            self.compensate(&task, run).await;
            return Ok(());
        }

        if run.retry_index + 1 >= task.retry_policy.max_attempts {
            info!(run_id = %run.id, "retry: budget exhausted, compensating");
            self.compensate(&task, run).await;
            return Ok(());
        }

        let delay_secs = delayed_secs(&task.retry_policy, run.retry_index);
        let now_ms = self.clock.epoch_ms();
        let due_at_ms = now_ms + delay_secs * 1000;
        info!(run_id = %run.id, delay_secs, backoff = ?task.retry_policy.backoff, "retry: scheduling delayed re-execution");
        self.delayed.lock().push(DelayedEntry { run, due_at_ms });
        Ok(())
    }

    async fn compensate(&self, task: &Task, run: TaskRun) {
        // `task.failure_count` is bumped by the reconcile loop's counter
        // pass, not here - it owns both counters (SPEC_FULL.md §9).
        let event = RetryExhaustedAlert {
            task_id: task.id.clone(),
            run_id: run.id.clone(),
            attempts: run.retry_index + 1,
            last_error: run.error_message.clone().unwrap_or_default(),
        };
        self.alerts.alert(event.clone()).await;

        if let Some(handler) = self.compensation_handlers.get(task.project_id.as_str()) {
            handler.compensate(&event).await;
        }
    }

    /// Pop due entries from the delayed queue and hand them back to the
    /// caller for re-dispatch via the scheduler's trigger path. Returns the
    /// `TaskId`s that should be re-run; the caller is expected to bump
    /// `next_run_at_ms` and let the next scheduler tick pick them up.
    pub fn pop_due(&self, now_ms: u64) -> Vec<TaskId> {
        let mut delayed = self.delayed.lock();
        let (due, pending): (Vec<_>, Vec<_>) = delayed.drain(..).partition(|e| e.due_at_ms <= now_ms);
        *delayed = pending;
        due.into_iter().map(|e| e.run.task_id).collect()
    }

    /// Drain every run currently sitting in the inbox channel and hand each
    /// to `consider`. Runs with `runtime_status` still non-terminal are
    /// skipped defensively (a caller bug, not an expected path).
    async fn drain_inbox(&self) {
        let mut runs = Vec::new();
        {
            let mut inbox = self.inbox.lock();
            while let Ok(run) = inbox.try_recv() {
                runs.push(run);
            }
        }
        for run in runs {
            if !run.runtime_status.is_terminal() && !run.is_terminal() {
                continue;
            }
            if let Err(e) = self.consider(run).await {
                warn!(error = %e, "failed to consider run for retry");
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if self.leadership.is_leader() {
                self.drain_inbox().await;
                let now_ms = self.clock.epoch_ms();
                for task_id in self.pop_due(now_ms) {
                    if let Err(e) = self.retrigger(&task_id, now_ms) {
                        warn!(%task_id, error = %e, "failed to retrigger task after delay");
                    }
                }
            }
            tokio::time::sleep(self.tick_interval).await;
        }
    }

    fn retrigger(&self, task_id: &TaskId, now_ms: u64) -> Result<(), RetryError> {
        let mut task = self.store.get_task(task_id)?;
        task.next_run_at_ms = now_ms;
        self.store.put_task(task)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::clock::FakeClock;
    use antcode_core::metadata_store::InMemoryMetadataStore;
    use antcode_core::model::{
        BackoffFamily, DispatchStatus, ExecutionStrategy, RuntimeStatus, ScheduleKind, TaskId, TaskRunId,
    };

    fn task_with_policy(policy: RetryPolicy) -> Task {
        Task {
            id: TaskId::new("t-1"),
            project_id: "p-1".into(),
            schedule: ScheduleKind::Once,
            strategy: ExecutionStrategy::AnyCapable,
            timeout_secs: 60,
            retry_policy: policy,
            priority: 0,
            active: true,
            success_count: 0,
            failure_count: 0,
            next_run_at_ms: 0,
        }
    }

    fn failed_run(retry_index: u32, error: Option<&str>) -> TaskRun {
        let mut run = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        run.retry_index = retry_index;
        run.error_message = error.map(|s| s.to_string());
        run.apply_dispatch_transition(DispatchStatus::Dispatched, 0);
        run.apply_runtime_transition(RuntimeStatus::Failed, 0);
        run
    }

    #[derive(Default)]
    struct NoopAlertSink;

    #[async_trait::async_trait]
    impl AlertSink for NoopAlertSink {
        async fn alert(&self, _event: RetryExhaustedAlert) {}
    }

    fn build_loop(
        policy: RetryPolicy,
    ) -> (RetryLoop<InMemoryMetadataStore, NoopAlertSink, FakeClock>, Arc<InMemoryMetadataStore>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_task(task_with_policy(policy)).unwrap();
        let (retry, _handle) = RetryLoop::new(
            Arc::clone(&store),
            Arc::new(NoopAlertSink),
            Arc::new(FakeClock::new(0)),
            Leadership::for_tests(true, 1),
            Duration::from_secs(1),
        );
        (retry, store)
    }

    #[tokio::test]
    async fn retryable_failure_within_budget_schedules_delay() {
        let (retry, _store) = build_loop(RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 5,
            max_delay_secs: 60,
            backoff: BackoffFamily::Fixed,
            jitter: false,
        });
        retry.consider(failed_run(0, Some("process crashed"))).await.unwrap();
        assert_eq!(retry.pop_due(4_999).len(), 0);
        assert_eq!(retry.pop_due(5_000).len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_compensates_immediately() {
        let (retry, store) = build_loop(RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 5,
            max_delay_secs: 60,
            backoff: BackoffFamily::Fixed,
            jitter: false,
        });
        retry
            .consider(failed_run(0, Some("Unauthorized: invalid API key")))
            .await
            .unwrap();
        assert_eq!(retry.pop_due(u64::MAX).len(), 0);
        // Compensation doesn't bump failure_count itself - that's the
        // reconcile loop's counter pass, driven off the run's terminal
        // status, not off compensate() running.
        let task = store.get_task(&TaskId::new("t-1")).unwrap();
        assert_eq!(task.failure_count, 0);
    }

    #[tokio::test]
    async fn exhausted_budget_compensates() {
        let (retry, store) = build_loop(RetryPolicy {
            max_attempts: 2,
            base_delay_secs: 5,
            max_delay_secs: 60,
            backoff: BackoffFamily::Fixed,
            jitter: false,
        });
        retry.consider(failed_run(1, Some("boom"))).await.unwrap();
        assert_eq!(retry.pop_due(u64::MAX).len(), 0);
        let task = store.get_task(&TaskId::new("t-1")).unwrap();
        assert_eq!(task.failure_count, 0);
    }
}
