// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TaskRun: one attempt at executing a [`Task`](super::Task).

use serde::{Deserialize, Serialize};

use crate::model::task::TaskId;
use crate::model::worker::WorkerId;
use crate::ordering::MonotonicUpdate;

crate::define_id! {
    /// Globally unique identifier for a single execution attempt.
    pub struct TaskRunId;
}

/// Dispatch-side status: did the Master succeed in handing this run to a
/// Worker queue. Ordered per spec.md §5: pending < dispatching < dispatched
/// < {acked, rejected, timeout, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Dispatching,
    Dispatched,
    Acked,
    Rejected,
    Timeout,
    Failed,
}

impl DispatchStatus {
    fn order(self) -> u32 {
        match self {
            DispatchStatus::Pending => 0,
            DispatchStatus::Dispatching => 1,
            DispatchStatus::Dispatched => 2,
            DispatchStatus::Acked
            | DispatchStatus::Rejected
            | DispatchStatus::Timeout
            | DispatchStatus::Failed => 3,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchStatus::Acked
                | DispatchStatus::Rejected
                | DispatchStatus::Timeout
                | DispatchStatus::Failed
        )
    }
}

/// Runtime-side status: what actually happened on the Worker. Ordered:
/// queued < running < {success, failed, cancelled, timeout, skipped}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    Skipped,
}

impl RuntimeStatus {
    fn order(self) -> u32 {
        match self {
            RuntimeStatus::Queued => 0,
            RuntimeStatus::Running => 1,
            RuntimeStatus::Success
            | RuntimeStatus::Failed
            | RuntimeStatus::Cancelled
            | RuntimeStatus::Timeout
            | RuntimeStatus::Skipped => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeStatus::Success
                | RuntimeStatus::Failed
                | RuntimeStatus::Cancelled
                | RuntimeStatus::Timeout
                | RuntimeStatus::Skipped
        )
    }
}

/// The overall status derived from `(dispatch_status, runtime_status)` by the
/// fixed projection in SPEC_FULL.md §3.1. Never stored; always recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    Dispatched,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
    Skipped,
}

/// One attempt at executing a Task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub task_id: TaskId,
    pub dispatch_status: DispatchStatus,
    pub runtime_status: RuntimeStatus,
    pub assigned_worker: Option<WorkerId>,
    /// When this TaskRun record was created by the scheduler, regardless of
    /// when (or whether) it ever starts running. Used by the reconcile
    /// loop's zombie-cleanup pass (spec.md §4.3).
    pub created_at_ms: u64,
    pub start_time_ms: Option<u64>,
    pub end_time_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub retry_index: u32,
    pub last_heartbeat_ms: Option<u64>,
    /// Timestamp of the most recently accepted dispatch-status transition,
    /// used to drop stale at-least-once redeliveries on that axis.
    last_dispatch_at_ms: u64,
    /// Timestamp of the most recently accepted runtime-status transition.
    last_runtime_at_ms: u64,
    /// Set once the reconcile loop has folded this run's outcome into its
    /// Task's `success_count`/`failure_count`. A crash between reaching a
    /// terminal status and this flip self-heals on the next reconcile tick
    /// instead of double- or never-counting.
    #[serde(default)]
    pub counted: bool,
}

struct PendingTransition {
    order: u32,
    at_ms: u64,
}

impl MonotonicUpdate for PendingTransition {
    fn order(&self) -> u32 {
        self.order
    }
    fn at_ms(&self) -> u64 {
        self.at_ms
    }
}

impl TaskRun {
    pub fn new(id: TaskRunId, task_id: TaskId, now_ms: u64) -> Self {
        Self {
            id,
            task_id,
            dispatch_status: DispatchStatus::Pending,
            runtime_status: RuntimeStatus::Queued,
            assigned_worker: None,
            created_at_ms: now_ms,
            start_time_ms: None,
            end_time_ms: None,
            exit_code: None,
            error_message: None,
            retry_index: 0,
            last_heartbeat_ms: None,
            last_dispatch_at_ms: 0,
            last_runtime_at_ms: 0,
            counted: false,
        }
    }

    /// The derived overall status; see SPEC_FULL.md §3.1.
    pub fn overall_status(&self) -> OverallStatus {
        use DispatchStatus as D;
        use RuntimeStatus as R;
        match (self.dispatch_status, self.runtime_status) {
            (D::Pending, _) | (D::Dispatching, _) => OverallStatus::Pending,
            (D::Dispatched, R::Queued) => OverallStatus::Dispatched,
            (D::Dispatched, R::Running) => OverallStatus::Running,
            (D::Dispatched, R::Success) => OverallStatus::Success,
            (D::Dispatched, R::Failed) => OverallStatus::Failed,
            (D::Dispatched, R::Cancelled) => OverallStatus::Cancelled,
            (D::Dispatched, R::Timeout) => OverallStatus::Timeout,
            (D::Dispatched, R::Skipped) => OverallStatus::Skipped,
            (D::Rejected, _) => OverallStatus::Failed,
            (D::Timeout, _) => OverallStatus::Timeout,
            (D::Failed, _) => OverallStatus::Failed,
            (D::Acked, _) => OverallStatus::Dispatched,
        }
    }

    /// Apply a dispatch-status transition, honoring monotonicity. Returns
    /// `true` if applied, `false` if dropped as stale (spec.md §7: invariant
    /// violations are silent no-ops).
    pub fn apply_dispatch_transition(&mut self, status: DispatchStatus, now_ms: u64) -> bool {
        let candidate = PendingTransition {
            order: status.order(),
            at_ms: now_ms,
        };
        let current = PendingTransition {
            order: self.dispatch_status.order(),
            at_ms: self.last_dispatch_at_ms,
        };
        if !crate::ordering::accepts(Some(&current), &candidate) {
            return false;
        }
        self.dispatch_status = status;
        self.last_dispatch_at_ms = now_ms;
        if status.is_terminal() && self.end_time_ms.is_none() {
            self.end_time_ms = Some(now_ms);
        }
        true
    }

    /// Apply a runtime-status transition, honoring monotonicity.
    pub fn apply_runtime_transition(&mut self, status: RuntimeStatus, now_ms: u64) -> bool {
        let candidate = PendingTransition {
            order: status.order(),
            at_ms: now_ms,
        };
        let current = PendingTransition {
            order: self.runtime_status.order(),
            at_ms: self.last_runtime_at_ms,
        };
        if !crate::ordering::accepts(Some(&current), &candidate) {
            return false;
        }
        self.runtime_status = status;
        self.last_runtime_at_ms = now_ms;
        if status.is_terminal() && self.end_time_ms.is_none() {
            self.end_time_ms = Some(now_ms);
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.overall_status(),
            OverallStatus::Success
                | OverallStatus::Failed
                | OverallStatus::Cancelled
                | OverallStatus::Timeout
                | OverallStatus::Skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> TaskRun {
        TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0)
    }

    #[test]
    fn overall_status_pending_before_dispatch() {
        let r = run();
        assert_eq!(r.overall_status(), OverallStatus::Pending);
    }

    #[test]
    fn dispatch_transition_is_monotonic() {
        let mut r = run();
        assert!(r.apply_dispatch_transition(DispatchStatus::Dispatching, 10));
        assert!(r.apply_dispatch_transition(DispatchStatus::Dispatched, 20));
        // Stale replay of an earlier transition at the same or earlier order is dropped.
        assert!(!r.apply_dispatch_transition(DispatchStatus::Dispatching, 30));
        assert_eq!(r.dispatch_status, DispatchStatus::Dispatched);
    }

    #[test]
    fn terminal_dispatch_sets_end_time_once() {
        let mut r = run();
        assert!(r.apply_dispatch_transition(DispatchStatus::Failed, 50));
        assert_eq!(r.end_time_ms, Some(50));
        // A later redelivery of a terminal status at the same order is
        // rejected by monotonicity, so end_time never regresses.
        assert!(!r.apply_dispatch_transition(DispatchStatus::Failed, 999));
        assert_eq!(r.end_time_ms, Some(50));
    }

    #[test]
    fn overall_status_maps_dispatched_running_to_running() {
        let mut r = run();
        r.apply_dispatch_transition(DispatchStatus::Dispatched, 1);
        r.apply_runtime_transition(RuntimeStatus::Running, 2);
        assert_eq!(r.overall_status(), OverallStatus::Running);
    }

    #[test]
    fn runtime_transition_rejects_stale_regression() {
        let mut r = run();
        r.apply_dispatch_transition(DispatchStatus::Dispatched, 1);
        assert!(r.apply_runtime_transition(RuntimeStatus::Running, 5));
        assert!(r.apply_runtime_transition(RuntimeStatus::Success, 6));
        assert!(!r.apply_runtime_transition(RuntimeStatus::Running, 4));
        assert_eq!(r.runtime_status, RuntimeStatus::Success);
    }
}
