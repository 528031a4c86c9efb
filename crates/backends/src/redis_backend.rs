// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Redis-backed implementations of the Queue/Dedup/Progress/LogStorage
//! abstractions (spec.md §4.10, §6).
//!
//! Queues use Streams + consumer groups (XADD/XREADGROUP/XCLAIM/XACK) so
//! delivery and reclaim follow Redis's own pending-entries-list semantics.
//! Dedup and progress counters use small Lua scripts via `redis::Script` so
//! the check-then-write sequence is atomic server-side.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::BTreeMap;

use crate::dedup::{DedupError, DedupResult, DedupStore};
use crate::log_storage::{
    HealthStatus, LogChannel, LogChunk, LogEntry, LogStorageBackend, LogStorageError, LogStorageResult,
};
use crate::progress::{ProgressError, ProgressResult, ProgressStore};
use crate::queue::{DequeuedItem, QueueBackend, QueueError, QueueResult, QueueStats};

fn to_queue_err(e: redis::RedisError) -> QueueError {
    QueueError::Transport(e.to_string())
}
fn to_dedup_err(e: redis::RedisError) -> DedupError {
    DedupError::Transport(e.to_string())
}
fn to_progress_err(e: redis::RedisError) -> ProgressError {
    ProgressError::Transport(e.to_string())
}
fn to_log_err(e: redis::RedisError) -> LogStorageError {
    LogStorageError::Transport(e.to_string())
}

fn stream_key(namespace: &str, project_id: &str) -> String {
    format!("{namespace}:crawl:{project_id}:ready")
}
fn processing_key(namespace: &str, project_id: &str) -> String {
    format!("{namespace}:crawl:{project_id}:group")
}
const CONSUMER_GROUP: &str = "antcode-workers";

pub struct RedisQueueBackend {
    conn: ConnectionManager,
    namespace: String,
    max_deliveries: u32,
}

impl RedisQueueBackend {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>, max_deliveries: u32) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            max_deliveries,
        }
    }

    async fn ensure_group(&self, key: &str) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(key, CONSUMER_GROUP, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(
        &self,
        project_id: &str,
        tasks: Vec<serde_json::Value>,
        priority: i32,
    ) -> QueueResult<Vec<String>> {
        let key = stream_key(&self.namespace, project_id);
        self.ensure_group(&key).await.map_err(to_queue_err)?;
        let mut conn = self.conn.clone();
        let mut ids = Vec::with_capacity(tasks.len());
        for payload in tasks {
            let body = serde_json::to_string(&payload)?;
            let id: String = conn
                .xadd(&key, "*", &[("priority", priority.to_string()), ("payload", body)])
                .await
                .map_err(to_queue_err)?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn dequeue(
        &self,
        project_id: &str,
        consumer: &str,
        count: u32,
        timeout_ms: u64,
    ) -> QueueResult<Vec<DequeuedItem>> {
        let key = stream_key(&self.namespace, project_id);
        self.ensure_group(&key).await.map_err(to_queue_err)?;
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(count as usize)
            .block(timeout_ms as usize);
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[&key], &[">"], &opts)
            .await
            .map_err(to_queue_err)?;
        let mut out = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let payload_raw: String = id
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .unwrap_or_default();
                let payload = serde_json::from_str(&payload_raw)?;
                out.push(DequeuedItem {
                    msg_id: id.id,
                    payload,
                    delivery_count: 1,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, project_id: &str, msg_ids: &[String]) -> QueueResult<()> {
        let key = stream_key(&self.namespace, project_id);
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&key, CONSUMER_GROUP, msg_ids).await.map_err(to_queue_err)?;
        Ok(())
    }

    async fn reclaim(
        &self,
        project_id: &str,
        min_idle_ms: u64,
        count: u32,
    ) -> QueueResult<Vec<DequeuedItem>> {
        let key = stream_key(&self.namespace, project_id);
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(&key, CONSUMER_GROUP, "-", "+", count as usize)
            .await
            .map_err(to_queue_err)?;
        let mut out = Vec::new();
        let max_deliveries = self.max_deliveries;
        for entry in pending.ids {
            if (entry.times_delivered as u32) > max_deliveries {
                self.move_to_dead_letter(project_id, &[entry.id.clone()]).await?;
                continue;
            }
            let claimed: redis::streams::StreamClaimReply = conn
                .xclaim(&key, CONSUMER_GROUP, "reclaimer", min_idle_ms as usize, &[&entry.id])
                .await
                .map_err(to_queue_err)?;
            for id in claimed.ids {
                let payload_raw: String = id
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .unwrap_or_default();
                let payload = serde_json::from_str(&payload_raw)?;
                out.push(DequeuedItem {
                    msg_id: id.id,
                    payload,
                    delivery_count: entry.times_delivered as u32 + 1,
                });
            }
        }
        Ok(out)
    }

    async fn stats(&self, project_id: &str) -> QueueResult<QueueStats> {
        let key = stream_key(&self.namespace, project_id);
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingReply =
            conn.xpending(&key, CONSUMER_GROUP).await.map_err(to_queue_err)?;
        let total_len: u64 = conn.xlen(&key).await.map_err(to_queue_err)?;
        let in_flight = match pending {
            redis::streams::StreamPendingReply::Empty => 0,
            redis::streams::StreamPendingReply::Data(data) => data.count as u64,
        };
        let dead_letter: u64 = conn
            .zcard(format!("{}:dead", processing_key(&self.namespace, project_id)))
            .await
            .unwrap_or(0);
        Ok(QueueStats {
            pending: total_len.saturating_sub(in_flight),
            in_flight,
            dead_letter,
        })
    }

    async fn move_to_dead_letter(&self, project_id: &str, msg_ids: &[String]) -> QueueResult<()> {
        let key = stream_key(&self.namespace, project_id);
        let dead_key = format!("{}:dead", processing_key(&self.namespace, project_id));
        let mut conn = self.conn.clone();
        for id in msg_ids {
            let _: i64 = conn.zadd(&dead_key, id, 0).await.map_err(to_queue_err)?;
        }
        let _: i64 = conn.xack(&key, CONSUMER_GROUP, msg_ids).await.map_err(to_queue_err)?;
        Ok(())
    }
}

/// Atomic add-if-absent, used in place of a real Bloom filter when the
/// RedisBloom module isn't loaded. `ensure_store`'s capacity/error_rate
/// inputs are accepted for interface parity but only consulted by a
/// RedisBloom-enabled deployment (`BF.RESERVE`).
const DEDUP_ADD_SCRIPT: &str = r#"
if redis.call("SISMEMBER", KEYS[1], ARGV[1]) == 1 then
  return 0
end
redis.call("SADD", KEYS[1], ARGV[1])
return 1
"#;

pub struct RedisDedupStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisDedupStore {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    fn key(&self, project_id: &str) -> String {
        format!("{}:dedup:{}", self.namespace, project_id)
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn ensure_store(&self, _project_id: &str, _capacity: u64, _error_rate: f64) -> DedupResult<()> {
        Ok(())
    }

    async fn exists(&self, project_id: &str, fp: &str) -> DedupResult<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(self.key(project_id), fp).await.map_err(to_dedup_err)
    }

    async fn add(&self, project_id: &str, fp: &str) -> DedupResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = Script::new(DEDUP_ADD_SCRIPT)
            .key(self.key(project_id))
            .arg(fp)
            .invoke_async(&mut conn)
            .await
            .map_err(to_dedup_err)?;
        Ok(added == 1)
    }

    async fn exists_many(&self, project_id: &str, fps: &[String]) -> DedupResult<Vec<bool>> {
        let mut out = Vec::with_capacity(fps.len());
        for fp in fps {
            out.push(self.exists(project_id, fp).await?);
        }
        Ok(out)
    }

    async fn add_many(&self, project_id: &str, fps: &[String]) -> DedupResult<Vec<bool>> {
        let mut out = Vec::with_capacity(fps.len());
        for fp in fps {
            out.push(self.add(project_id, fp).await?);
        }
        Ok(out)
    }

    async fn size(&self, project_id: &str) -> DedupResult<u64> {
        let mut conn = self.conn.clone();
        conn.scard(self.key(project_id)).await.map_err(to_dedup_err)
    }

    async fn clear(&self, project_id: &str) -> DedupResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(project_id)).await.map_err(to_dedup_err)?;
        Ok(())
    }
}

pub struct RedisProgressStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisProgressStore {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    fn batch_key(&self, project_id: &str, batch_id: &str) -> String {
        format!("{}:progress:{}:{}", self.namespace, project_id, batch_id)
    }

    fn checkpoint_key(&self, project_id: &str, batch_id: &str) -> String {
        format!("{}:checkpoint:{}:{}", self.namespace, project_id, batch_id)
    }

    fn active_key(&self, project_id: &str) -> String {
        format!("{}:active_workers:{}", self.namespace, project_id)
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn get(&self, project_id: &str, batch_id: &str) -> ProgressResult<BTreeMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(self.batch_key(project_id, batch_id))
            .await
            .map_err(to_progress_err)
    }

    async fn set(&self, project_id: &str, batch_id: &str, values: BTreeMap<String, String>) -> ProgressResult<()> {
        let mut conn = self.conn.clone();
        let key = self.batch_key(project_id, batch_id);
        let _: () = conn.del(&key).await.map_err(to_progress_err)?;
        if !values.is_empty() {
            let _: () = conn
                .hset_multiple(&key, &values.into_iter().collect::<Vec<_>>())
                .await
                .map_err(to_progress_err)?;
        }
        Ok(())
    }

    async fn update(&self, project_id: &str, batch_id: &str, values: BTreeMap<String, String>) -> ProgressResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(self.batch_key(project_id, batch_id), &values.into_iter().collect::<Vec<_>>())
            .await
            .map_err(to_progress_err)?;
        Ok(())
    }

    async fn increment(&self, project_id: &str, batch_id: &str, field: &str, by: i64) -> ProgressResult<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(self.batch_key(project_id, batch_id), field, by)
            .await
            .map_err(to_progress_err)
    }

    async fn save_checkpoint(&self, project_id: &str, batch_id: &str, checkpoint: &str) -> ProgressResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(self.checkpoint_key(project_id, batch_id), checkpoint)
            .await
            .map_err(to_progress_err)?;
        Ok(())
    }

    async fn load_checkpoint(&self, project_id: &str, batch_id: &str) -> ProgressResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.checkpoint_key(project_id, batch_id))
            .await
            .map_err(to_progress_err)
    }

    async fn register_active_worker(&self, project_id: &str, worker_id: &str, ttl_secs: u64) -> ProgressResult<()> {
        let mut conn = self.conn.clone();
        let key = self.active_key(project_id);
        let worker_key = format!("{key}:{worker_id}");
        let _: () = conn.set_ex(&worker_key, 1, ttl_secs).await.map_err(to_progress_err)?;
        let _: () = conn.sadd(&key, worker_id).await.map_err(to_progress_err)?;
        Ok(())
    }

    async fn list_active_workers(&self, project_id: &str) -> ProgressResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = self.active_key(project_id);
        let members: Vec<String> = conn.smembers(&key).await.map_err(to_progress_err)?;
        let mut active = Vec::new();
        for member in members {
            let worker_key = format!("{key}:{member}");
            let exists: bool = conn.exists(&worker_key).await.map_err(to_progress_err)?;
            if exists {
                active.push(member);
            } else {
                let _: () = conn.srem(&key, &member).await.map_err(to_progress_err)?;
            }
        }
        Ok(active)
    }
}

pub struct RedisLogStorage {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisLogStorage {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    fn stream_key(&self, run_id: &str) -> String {
        format!("{}:log:stream:{}", self.namespace, run_id)
    }

    fn chunk_key(&self, run_id: &str) -> String {
        format!("{}:log:chunk:{}", self.namespace, run_id)
    }
}

#[async_trait]
impl LogStorageBackend for RedisLogStorage {
    async fn write_log(&self, entry: LogEntry) -> LogStorageResult<()> {
        self.write_log_batch(vec![entry]).await
    }

    async fn write_log_batch(&self, entries: Vec<LogEntry>) -> LogStorageResult<()> {
        let mut conn = self.conn.clone();
        for entry in entries {
            let key = self.stream_key(&entry.run_id);
            let body = serde_json::to_string(&entry)?;
            let _: String = conn
                .xadd_maxlen(&key, redis::streams::StreamMaxlen::Approx(10_000), "*", &[("entry", body)])
                .await
                .map_err(to_log_err)?;
        }
        Ok(())
    }

    async fn write_chunk(&self, chunk: LogChunk) -> LogStorageResult<u64> {
        let mut conn = self.conn.clone();
        let key = self.chunk_key(&chunk.run_id);
        let len = chunk.data.len() as u64;
        let _: i64 = conn
            .zadd(&key, chunk.data, chunk.offset)
            .await
            .map_err(to_log_err)?;
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
        let mut conn = self.conn.clone();
        let key = self.chunk_key(run_id);
        let raw: Vec<(Vec<u8>, f64)> = conn.zrangebyscore_withscores(&key, "-inf", "+inf").await.map_err(to_log_err)?;
        let merged: Vec<u8> = raw.into_iter().flat_map(|(bytes, _)| bytes).collect();
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
        Ok(())
    }

    async fn query_logs(
        &self,
        run_id: &str,
        channel: Option<LogChannel>,
        start_seq: u64,
        limit: u32,
    ) -> LogStorageResult<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let key = self.stream_key(run_id);
        let reply: redis::streams::StreamRangeReply = conn
            .xrange_count(&key, "-", "+", limit as usize)
            .await
            .map_err(to_log_err)?;
        let mut out = Vec::new();
        for id in reply.ids {
            let Some(raw) = id.map.get("entry") else { continue };
            let raw: String = redis::from_redis_value(raw).map_err(to_log_err)?;
            let entry: LogEntry = serde_json::from_str(&raw)?;
            if entry.seq < start_seq {
                continue;
            }
            if let Some(c) = channel {
                if entry.channel != c {
                    continue;
                }
            }
            out.push(entry);
        }
        Ok(out)
    }

    async fn get_log_stream(&self, run_id: &str, _channel: LogChannel) -> LogStorageResult<Vec<u8>> {
        let mut conn = self.conn.clone();
        let key = self.chunk_key(run_id);
        let raw: Vec<(Vec<u8>, f64)> = conn.zrangebyscore_withscores(&key, "-inf", "+inf").await.map_err(to_log_err)?;
        Ok(raw.into_iter().flat_map(|(bytes, _)| bytes).collect())
    }

    async fn delete_logs(&self, run_id: &str) -> LogStorageResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.stream_key(run_id)).await.map_err(to_log_err)?;
        let _: () = conn.del(self.chunk_key(run_id)).await.map_err(to_log_err)?;
        Ok(())
    }

    async fn get_presigned_upload_url(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<String> {
        Ok(format!("{}:log:presign:{run_id}:{channel:?}:upload", self.namespace))
    }

    async fn get_presigned_download_url(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<String> {
        Ok(format!("{}:log:presign:{run_id}:{channel:?}:download", self.namespace))
    }

    async fn health_check(&self) -> LogStorageResult<HealthStatus> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(to_log_err)?;
        Ok(HealthStatus {
            healthy: pong == "PONG",
            detail: None,
        })
    }
}
