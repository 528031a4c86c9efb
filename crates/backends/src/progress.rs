// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ProgressStore: per `(project_id, batch_id)` key-value and counters,
//! plus active-worker registration with TTL (spec.md §4.10).

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("transport error: {0}")]
    Transport(String),
}

pub type ProgressResult<T> = Result<T, ProgressError>;

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, project_id: &str, batch_id: &str) -> ProgressResult<BTreeMap<String, String>>;
    async fn set(&self, project_id: &str, batch_id: &str, values: BTreeMap<String, String>) -> ProgressResult<()>;
    async fn update(&self, project_id: &str, batch_id: &str, values: BTreeMap<String, String>) -> ProgressResult<()>;
    /// Atomic increment of a named counter; must not lose updates under
    /// concurrent incrementers (Redis backend uses a server-side script).
    async fn increment(&self, project_id: &str, batch_id: &str, field: &str, by: i64) -> ProgressResult<i64>;

    async fn save_checkpoint(&self, project_id: &str, batch_id: &str, checkpoint: &str) -> ProgressResult<()>;
    async fn load_checkpoint(&self, project_id: &str, batch_id: &str) -> ProgressResult<Option<String>>;

    async fn register_active_worker(&self, project_id: &str, worker_id: &str, ttl_secs: u64) -> ProgressResult<()>;
    /// Returns currently active workers, lazily dropping any whose
    /// registration TTL has expired.
    async fn list_active_workers(&self, project_id: &str) -> ProgressResult<Vec<String>>;
}
