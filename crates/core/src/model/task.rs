// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task: the persistent specification of work.

use serde::{Deserialize, Serialize};

use crate::model::worker::WorkerId;

crate::define_id! {
    /// Stable public identifier for a [`Task`]. Distinct from whatever row id
    /// the metadata store uses internally.
    pub struct TaskId;
}

/// How a Task is scheduled to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Run exactly once, as soon as it is activated.
    Once,
    /// Cron expression in the metadata store's configured timezone.
    Cron { expression: String },
    /// Fixed interval between runs, in seconds.
    Interval { seconds: u64 },
}

/// How the Master picks a Worker to run a Task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Must run on exactly this worker; fail if it is offline.
    Fixed { worker_id: WorkerId },
    /// Same as `Fixed`, named separately because the source schema
    /// distinguishes "admin pinned this" from "task requires this".
    Specified { worker_id: WorkerId },
    /// Any worker whose declared capabilities satisfy the project type.
    AnyCapable,
    /// Prefer a bound worker; fall back to `AnyCapable` if it is offline.
    PreferBound { worker_id: WorkerId },
}

/// Backoff family for the retry loop (see [`RetryPolicy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffFamily {
    Fixed,
    Linear,
    Exponential,
}

/// A Task's retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub backoff: BackoffFamily,
    /// Apply up to ±10% jitter to the computed delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 5,
            max_delay_secs: 300,
            backoff: BackoffFamily::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Compute the un-jittered delay for a given zero-based retry index.
    pub fn base_delay_for(&self, retry_index: u32) -> u64 {
        let delay = match self.backoff {
            BackoffFamily::Fixed => self.base_delay_secs,
            BackoffFamily::Linear => self.base_delay_secs.saturating_mul((retry_index + 1) as u64),
            BackoffFamily::Exponential => self
                .base_delay_secs
                .saturating_mul(1u64.checked_shl(retry_index).unwrap_or(u64::MAX)),
        };
        delay.min(self.max_delay_secs)
    }
}

/// The persistent specification of a schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: String,
    pub schedule: ScheduleKind,
    pub strategy: ExecutionStrategy,
    /// Hard ceiling on a single TaskRun's wall-clock duration, in seconds.
    pub timeout_secs: u64,
    pub retry_policy: RetryPolicy,
    pub priority: i32,
    pub active: bool,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// Epoch milliseconds; Task is eligible once this has passed.
    pub next_run_at_ms: u64,
}

impl Task {
    /// True when this Task is active and due.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.active && self.next_run_at_ms <= now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_secs: 1,
            max_delay_secs: 20,
            backoff: BackoffFamily::Exponential,
            jitter: false,
        };
        assert_eq!(policy.base_delay_for(0), 1);
        assert_eq!(policy.base_delay_for(1), 2);
        assert_eq!(policy.base_delay_for(4), 16);
        assert_eq!(policy.base_delay_for(10), 20);
    }

    #[test]
    fn linear_backoff_scales_with_retry_index() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_secs: 3,
            max_delay_secs: 100,
            backoff: BackoffFamily::Linear,
            jitter: false,
        };
        assert_eq!(policy.base_delay_for(0), 3);
        assert_eq!(policy.base_delay_for(2), 9);
    }

    #[test]
    fn task_is_due_requires_active_and_past_next_run() {
        let mut task = Task {
            id: TaskId::new("t-1"),
            project_id: "p-1".into(),
            schedule: ScheduleKind::Once,
            strategy: ExecutionStrategy::AnyCapable,
            timeout_secs: 60,
            retry_policy: RetryPolicy::default(),
            priority: 0,
            active: true,
            success_count: 0,
            failure_count: 0,
            next_run_at_ms: 1_000,
        };
        assert!(!task.is_due(500));
        assert!(task.is_due(1_000));
        task.active = false;
        assert!(!task.is_due(2_000));
    }
}
