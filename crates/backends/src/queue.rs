// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CrawlQueueBackend: a multi-project, multi-priority work queue (spec.md
//! §4.10), parameterized by project namespace so the same trait serves both
//! the rule-driven crawler plugin's per-project queues and the Master's
//! scheduler-to-worker ready queues (SPEC_FULL.md §9).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A queue entry paired with the receipt needed to ack or reclaim it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeuedItem {
    pub msg_id: String,
    pub payload: serde_json::Value,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub dead_letter: u64,
}

/// A multi-priority, at-least-once work queue scoped by project.
///
/// Invariants: at-most-one delivery per consumer between `dequeue` and
/// `ack`; items idle longer than `min_idle_ms` in the processing set may be
/// reclaimed by any consumer (incrementing delivery count); past a
/// configured delivery ceiling the reclaim path moves the item to the
/// dead-letter list instead of redelivering it.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue(
        &self,
        project_id: &str,
        tasks: Vec<serde_json::Value>,
        priority: i32,
    ) -> QueueResult<Vec<String>>;

    async fn dequeue(
        &self,
        project_id: &str,
        consumer: &str,
        count: u32,
        timeout_ms: u64,
    ) -> QueueResult<Vec<DequeuedItem>>;

    async fn ack(&self, project_id: &str, msg_ids: &[String]) -> QueueResult<()>;

    async fn reclaim(
        &self,
        project_id: &str,
        min_idle_ms: u64,
        count: u32,
    ) -> QueueResult<Vec<DequeuedItem>>;

    async fn stats(&self, project_id: &str) -> QueueResult<QueueStats>;

    async fn move_to_dead_letter(&self, project_id: &str, msg_ids: &[String]) -> QueueResult<()>;
}
