// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process implementations of the Queue/Dedup/Progress/LogStorage
//! abstractions, backing local development and the test suite.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dedup::{DedupResult, DedupStore};
use crate::log_storage::{
    HealthStatus, LogChannel, LogChunk, LogEntry, LogStorageBackend, LogStorageError, LogStorageResult,
};
use crate::progress::{ProgressResult, ProgressStore};
use crate::queue::{DequeuedItem, QueueBackend, QueueResult, QueueStats};

struct QueueEntry {
    msg_id: String,
    payload: serde_json::Value,
    priority: i32,
    delivery_count: u32,
    in_flight_since_ms: Option<u64>,
}

#[derive(Default)]
struct ProjectQueue {
    pending: VecDeque<QueueEntry>,
    in_flight: BTreeMap<String, QueueEntry>,
    dead_letter: Vec<QueueEntry>,
    next_id: u64,
}

/// In-memory `QueueBackend`; `min_idle_ms` reclaim compares against a
/// caller-supplied logical clock (`now_ms`), not wall time, via `reclaim`'s
/// `min_idle_ms` argument applied to insertion order rather than real time —
/// acceptable for single-process tests that don't need wall-clock idling.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    projects: Mutex<BTreeMap<String, ProjectQueue>>,
    max_deliveries: u32,
}

impl InMemoryQueueBackend {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            projects: Mutex::default(),
            max_deliveries,
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(
        &self,
        project_id: &str,
        tasks: Vec<serde_json::Value>,
        priority: i32,
    ) -> QueueResult<Vec<String>> {
        let mut projects = self.projects.lock();
        let queue = projects.entry(project_id.to_string()).or_default();
        let mut ids = Vec::with_capacity(tasks.len());
        for payload in tasks {
            queue.next_id += 1;
            let msg_id = format!("{}-0", queue.next_id);
            ids.push(msg_id.clone());
            let entry = QueueEntry {
                msg_id,
                payload,
                priority,
                delivery_count: 0,
                in_flight_since_ms: None,
            };
            let pos = queue
                .pending
                .iter()
                .position(|e| e.priority < priority)
                .unwrap_or(queue.pending.len());
            queue.pending.insert(pos, entry);
        }
        Ok(ids)
    }

    async fn dequeue(
        &self,
        project_id: &str,
        _consumer: &str,
        count: u32,
        _timeout_ms: u64,
    ) -> QueueResult<Vec<DequeuedItem>> {
        let mut projects = self.projects.lock();
        let queue = projects.entry(project_id.to_string()).or_default();
        let mut out = Vec::new();
        for _ in 0..count {
            let Some(mut entry) = queue.pending.pop_front() else {
                break;
            };
            entry.delivery_count += 1;
            entry.in_flight_since_ms = Some(0);
            out.push(DequeuedItem {
                msg_id: entry.msg_id.clone(),
                payload: entry.payload.clone(),
                delivery_count: entry.delivery_count,
            });
            queue.in_flight.insert(entry.msg_id.clone(), entry);
        }
        Ok(out)
    }

    async fn ack(&self, project_id: &str, msg_ids: &[String]) -> QueueResult<()> {
        let mut projects = self.projects.lock();
        if let Some(queue) = projects.get_mut(project_id) {
            for id in msg_ids {
                queue.in_flight.remove(id);
            }
        }
        Ok(())
    }

    async fn reclaim(
        &self,
        project_id: &str,
        _min_idle_ms: u64,
        count: u32,
    ) -> QueueResult<Vec<DequeuedItem>> {
        let mut projects = self.projects.lock();
        let queue = projects.entry(project_id.to_string()).or_default();
        let ids: Vec<String> = queue.in_flight.keys().take(count as usize).cloned().collect();
        let max_deliveries = self.max_deliveries;
        let mut out = Vec::new();
        for id in ids {
            let mut entry = queue.in_flight.remove(&id).expect("key from this map");
            entry.delivery_count += 1;
            if entry.delivery_count > max_deliveries {
                queue.dead_letter.push(entry);
                continue;
            }
            out.push(DequeuedItem {
                msg_id: entry.msg_id.clone(),
                payload: entry.payload.clone(),
                delivery_count: entry.delivery_count,
            });
            queue.in_flight.insert(entry.msg_id.clone(), entry);
        }
        Ok(out)
    }

    async fn stats(&self, project_id: &str) -> QueueResult<QueueStats> {
        let projects = self.projects.lock();
        Ok(match projects.get(project_id) {
            Some(queue) => QueueStats {
                pending: queue.pending.len() as u64,
                in_flight: queue.in_flight.len() as u64,
                dead_letter: queue.dead_letter.len() as u64,
            },
            None => QueueStats::default(),
        })
    }

    async fn move_to_dead_letter(&self, project_id: &str, msg_ids: &[String]) -> QueueResult<()> {
        let mut projects = self.projects.lock();
        let queue = projects.entry(project_id.to_string()).or_default();
        for id in msg_ids {
            if let Some(entry) = queue.in_flight.remove(id) {
                queue.dead_letter.push(entry);
            }
        }
        Ok(())
    }
}

/// In-memory `DedupStore`: one `HashSet<String>` of fingerprints per project.
#[derive(Default)]
pub struct InMemoryDedupStore {
    projects: Mutex<BTreeMap<String, HashSet<String>>>,
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn ensure_store(&self, project_id: &str, _capacity: u64, _error_rate: f64) -> DedupResult<()> {
        self.projects.lock().entry(project_id.to_string()).or_default();
        Ok(())
    }

    async fn exists(&self, project_id: &str, fp: &str) -> DedupResult<bool> {
        Ok(self
            .projects
            .lock()
            .get(project_id)
            .map(|set| set.contains(fp))
            .unwrap_or(false))
    }

    async fn add(&self, project_id: &str, fp: &str) -> DedupResult<bool> {
        let mut projects = self.projects.lock();
        let set = projects.entry(project_id.to_string()).or_default();
        Ok(set.insert(fp.to_string()))
    }

    async fn exists_many(&self, project_id: &str, fps: &[String]) -> DedupResult<Vec<bool>> {
        let projects = self.projects.lock();
        let set = projects.get(project_id);
        Ok(fps.iter().map(|fp| set.map(|s| s.contains(fp)).unwrap_or(false)).collect())
    }

    async fn add_many(&self, project_id: &str, fps: &[String]) -> DedupResult<Vec<bool>> {
        let mut projects = self.projects.lock();
        let set = projects.entry(project_id.to_string()).or_default();
        Ok(fps.iter().map(|fp| set.insert(fp.clone())).collect())
    }

    async fn size(&self, project_id: &str) -> DedupResult<u64> {
        Ok(self
            .projects
            .lock()
            .get(project_id)
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }

    async fn clear(&self, project_id: &str) -> DedupResult<()> {
        self.projects.lock().remove(project_id);
        Ok(())
    }
}

#[derive(Default)]
struct ProjectProgress {
    batches: BTreeMap<String, BTreeMap<String, String>>,
    checkpoints: BTreeMap<String, String>,
    active_workers: BTreeMap<String, u64>,
}

/// In-memory `ProgressStore`. Worker TTLs are enforced against an internal
/// monotonic counter rather than wall time, advanced once per registration.
#[derive(Default)]
pub struct InMemoryProgressStore {
    projects: Mutex<BTreeMap<String, ProjectProgress>>,
    clock: AtomicU64,
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get(&self, project_id: &str, batch_id: &str) -> ProgressResult<BTreeMap<String, String>> {
        Ok(self
            .projects
            .lock()
            .get(project_id)
            .and_then(|p| p.batches.get(batch_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn set(&self, project_id: &str, batch_id: &str, values: BTreeMap<String, String>) -> ProgressResult<()> {
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        project.batches.insert(batch_id.to_string(), values);
        Ok(())
    }

    async fn update(&self, project_id: &str, batch_id: &str, values: BTreeMap<String, String>) -> ProgressResult<()> {
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        project.batches.entry(batch_id.to_string()).or_default().extend(values);
        Ok(())
    }

    async fn increment(&self, project_id: &str, batch_id: &str, field: &str, by: i64) -> ProgressResult<i64> {
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        let batch = project.batches.entry(batch_id.to_string()).or_default();
        let current: i64 = batch.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + by;
        batch.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn save_checkpoint(&self, project_id: &str, batch_id: &str, checkpoint: &str) -> ProgressResult<()> {
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        project.checkpoints.insert(batch_id.to_string(), checkpoint.to_string());
        Ok(())
    }

    async fn load_checkpoint(&self, project_id: &str, batch_id: &str) -> ProgressResult<Option<String>> {
        Ok(self
            .projects
            .lock()
            .get(project_id)
            .and_then(|p| p.checkpoints.get(batch_id))
            .cloned())
    }

    async fn register_active_worker(&self, project_id: &str, worker_id: &str, ttl_secs: u64) -> ProgressResult<()> {
        let now = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        project.active_workers.insert(worker_id.to_string(), now + ttl_secs);
        Ok(())
    }

    async fn list_active_workers(&self, project_id: &str) -> ProgressResult<Vec<String>> {
        let now = self.clock.load(Ordering::SeqCst);
        let mut projects = self.projects.lock();
        let project = projects.entry(project_id.to_string()).or_default();
        project.active_workers.retain(|_, expires_at| *expires_at > now);
        Ok(project.active_workers.keys().cloned().collect())
    }
}

struct RunLogs {
    entries: Vec<LogEntry>,
    chunks: BTreeMap<u64, Vec<u8>>,
    finalized: bool,
}

/// In-memory `LogStorageBackend`. Presigned URLs are synthetic
/// `mem://{run_id}/{channel}` locators since there is no real object store.
#[derive(Default)]
pub struct InMemoryLogStorage {
    runs: Mutex<BTreeMap<String, RunLogs>>,
}

#[async_trait]
impl LogStorageBackend for InMemoryLogStorage {
    async fn write_log(&self, entry: LogEntry) -> LogStorageResult<()> {
        self.write_log_batch(vec![entry]).await
    }

    async fn write_log_batch(&self, entries: Vec<LogEntry>) -> LogStorageResult<()> {
        let mut runs = self.runs.lock();
        for entry in entries {
            let run = runs.entry(entry.run_id.clone()).or_insert_with(|| RunLogs {
                entries: Vec::new(),
                chunks: BTreeMap::new(),
                finalized: false,
            });
            run.entries.push(entry);
        }
        Ok(())
    }

    async fn write_chunk(&self, chunk: LogChunk) -> LogStorageResult<u64> {
        let mut runs = self.runs.lock();
        let run = runs.entry(chunk.run_id.clone()).or_insert_with(|| RunLogs {
            entries: Vec::new(),
            chunks: BTreeMap::new(),
            finalized: false,
        });
        let len = chunk.data.len() as u64;
        run.chunks.insert(chunk.offset, chunk.data);
        Ok(chunk.offset + len)
    }

    async fn finalize_chunks(
        &self,
        run_id: &str,
        _channel: LogChannel,
        total_size: u64,
        checksum: &str,
    ) -> LogStorageResult<()> {
        use sha2::{Digest, Sha256};
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| LogStorageError::Transport(format!("unknown run {run_id}")))?;
        let merged: Vec<u8> = run.chunks.values().flat_map(|c| c.iter().copied()).collect();
        if merged.len() as u64 != total_size {
            return Err(LogStorageError::ChecksumMismatch {
                run_id: run_id.to_string(),
                expected: total_size.to_string(),
                actual: merged.len().to_string(),
            });
        }
        let actual = hex::encode(Sha256::digest(&merged));
        if actual != checksum {
            return Err(LogStorageError::ChecksumMismatch {
                run_id: run_id.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }
        run.finalized = true;
        Ok(())
    }

    async fn query_logs(
        &self,
        run_id: &str,
        channel: Option<LogChannel>,
        start_seq: u64,
        limit: u32,
    ) -> LogStorageResult<Vec<LogEntry>> {
        let runs = self.runs.lock();
        let Some(run) = runs.get(run_id) else {
            return Ok(Vec::new());
        };
        Ok(run
            .entries
            .iter()
            .filter(|e| e.seq >= start_seq)
            .filter(|e| channel.map_or(true, |c| c == e.channel))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_log_stream(&self, run_id: &str, _channel: LogChannel) -> LogStorageResult<Vec<u8>> {
        let runs = self.runs.lock();
        Ok(runs
            .get(run_id)
            .map(|r| r.chunks.values().flat_map(|c| c.iter().copied()).collect())
            .unwrap_or_default())
    }

    async fn delete_logs(&self, run_id: &str) -> LogStorageResult<()> {
        self.runs.lock().remove(run_id);
        Ok(())
    }

    async fn get_presigned_upload_url(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<String> {
        Ok(format!("mem://{run_id}/{channel:?}/upload"))
    }

    async fn get_presigned_download_url(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<String> {
        Ok(format!("mem://{run_id}/{channel:?}/download"))
    }

    async fn health_check(&self) -> LogStorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            detail: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queue_dequeue_respects_priority_order() {
        let queue = InMemoryQueueBackend::new(3);
        queue.enqueue("p1", vec![json!({"n": 1})], 0).await.unwrap();
        queue.enqueue("p1", vec![json!({"n": 2})], 10).await.unwrap();
        let items = queue.dequeue("p1", "c1", 2, 0).await.unwrap();
        assert_eq!(items[0].payload, json!({"n": 2}));
        assert_eq!(items[1].payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn ack_removes_from_in_flight() {
        let queue = InMemoryQueueBackend::new(3);
        let ids = queue.enqueue("p1", vec![json!({"n": 1})], 0).await.unwrap();
        queue.dequeue("p1", "c1", 1, 0).await.unwrap();
        queue.ack("p1", &ids).await.unwrap();
        let stats = queue.stats("p1").await.unwrap();
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn reclaim_past_delivery_ceiling_moves_to_dead_letter() {
        let queue = InMemoryQueueBackend::new(1);
        queue.enqueue("p1", vec![json!({"n": 1})], 0).await.unwrap();
        queue.dequeue("p1", "c1", 1, 0).await.unwrap();
        let reclaimed = queue.reclaim("p1", 0, 1).await.unwrap();
        assert!(reclaimed.is_empty());
        let stats = queue.stats("p1").await.unwrap();
        assert_eq!(stats.dead_letter, 1);
    }

    #[tokio::test]
    async fn dedup_add_is_true_only_once() {
        let store = InMemoryDedupStore::default();
        assert!(store.add("p1", "fp1").await.unwrap());
        assert!(!store.add("p1", "fp1").await.unwrap());
        assert_eq!(store.size("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn progress_increment_accumulates() {
        let store = InMemoryProgressStore::default();
        assert_eq!(store.increment("p1", "b1", "count", 2).await.unwrap(), 2);
        assert_eq!(store.increment("p1", "b1", "count", 3).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn log_storage_finalize_checks_checksum() {
        use sha2::{Digest, Sha256};
        let storage = InMemoryLogStorage::default();
        storage
            .write_chunk(LogChunk {
                run_id: "r1".into(),
                channel: LogChannel::Stdout,
                offset: 0,
                data: b"hello".to_vec(),
                running_sha256: String::new(),
            })
            .await
            .unwrap();
        let checksum = hex::encode(Sha256::digest(b"hello"));
        storage
            .finalize_chunks("r1", LogChannel::Stdout, 5, &checksum)
            .await
            .unwrap();
        let err = storage
            .finalize_chunks("r1", LogChannel::Stdout, 5, "deadbeef")
            .await;
        assert!(err.is_err());
    }
}
