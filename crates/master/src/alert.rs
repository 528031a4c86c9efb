// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The retry loop's external alert collaborator (spec.md §4.4): notified
//! when a TaskRun exhausts its retry budget and compensation runs.

use async_trait::async_trait;

use antcode_core::model::{TaskId, TaskRunId};

/// One retry-budget-exhaustion event, handed to an [`AlertSink`].
#[derive(Debug, Clone)]
pub struct RetryExhaustedAlert {
    pub task_id: TaskId,
    pub run_id: TaskRunId,
    pub attempts: u32,
    pub last_error: String,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, event: RetryExhaustedAlert);
}

/// Logs the alert at `error` level. The production composition root may
/// substitute a sink that pages out instead; this one is always safe to
/// fall back to.
#[derive(Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn alert(&self, event: RetryExhaustedAlert) {
        tracing::error!(
            task_id = %event.task_id,
            run_id = %event.run_id,
            attempts = event.attempts,
            last_error = %event.last_error,
            "retry budget exhausted"
        );
    }
}

/// A task-type-specific compensation handler, invoked alongside the alert
/// when one is registered for the exhausted TaskRun's project type.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, event: &RetryExhaustedAlert);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn alert(&self, _event: RetryExhaustedAlert) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn alert_sink_is_invoked_once_per_event() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink(Arc::clone(&count));
        sink.alert(RetryExhaustedAlert {
            task_id: TaskId::new("t-1"),
            run_id: TaskRunId::new("r-1"),
            attempts: 3,
            last_error: "boom".into(),
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
