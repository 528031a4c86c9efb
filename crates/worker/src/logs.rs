// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dual-channel log emission (spec.md §4.9): a batched live sender with
//! backpressure over the queue-occupancy thresholds, and a durable chunked
//! archiver with monotonic offsets and a running checksum.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use antcode_backends::log_storage::{LogChannel, LogChunk, LogEntry, LogStorageBackend};

/// Batch-sender queue occupancy crosses these ratios to step through
/// Normal → Warning → Critical → Blocked (spec.md §4.9 item 1).
const WARNING_THRESHOLD: f64 = 0.7;
const CRITICAL_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureState {
    Normal,
    Warning,
    Critical,
    Blocked,
}

impl BackpressureState {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            BackpressureState::Blocked
        } else if ratio >= CRITICAL_THRESHOLD {
            BackpressureState::Critical
        } else if ratio >= WARNING_THRESHOLD {
            BackpressureState::Warning
        } else {
            BackpressureState::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPriority {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_queue_size: usize,
    pub drop_on_critical: bool,
    pub drop_priority: DropPriority,
    pub max_retries: u32,
    pub retry_delay: std::time::Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_queue_size: 10_000,
            drop_on_critical: true,
            drop_priority: DropPriority::Oldest,
            max_retries: 3,
            retry_delay: std::time::Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
pub struct BatchStats {
    pub total_queued: u64,
    pub total_sent: u64,
    pub total_dropped: u64,
    pub total_failed: u64,
}

struct Inner {
    queue: VecDeque<LogEntry>,
    stats: BatchStats,
}

/// Live log channel: per-line entries queued and flushed in batches to a
/// [`LogStorageBackend`]'s `write_log_batch`, applying backpressure as the
/// queue fills (spec.md §4.9 item 1).
pub struct BatchSender<L> {
    run_id: String,
    backend: Arc<L>,
    config: BatchConfig,
    inner: Mutex<Inner>,
    seq: AtomicU64,
}

impl<L: LogStorageBackend> BatchSender<L> {
    pub fn new(run_id: impl Into<String>, backend: Arc<L>, config: BatchConfig) -> Self {
        Self {
            run_id: run_id.into(),
            backend,
            config,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                stats: BatchStats::default(),
            }),
            seq: AtomicU64::new(0),
        }
    }

    /// Current backpressure state given queue occupancy.
    pub async fn backpressure_state(&self) -> BackpressureState {
        let inner = self.inner.lock().await;
        let ratio = inner.queue.len() as f64 / self.config.max_queue_size as f64;
        BackpressureState::from_ratio(ratio)
    }

    /// Enqueue one log line. Returns `false` if dropped under backpressure.
    pub async fn write(&self, channel: LogChannel, content: String, ts_ms: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let ratio = inner.queue.len() as f64 / self.config.max_queue_size as f64;
        let state = BackpressureState::from_ratio(ratio);

        if state == BackpressureState::Blocked {
            inner.stats.total_dropped += 1;
            return false;
        }
        if state == BackpressureState::Critical && self.config.drop_on_critical {
            inner.stats.total_dropped += 1;
            if self.config.drop_priority == DropPriority::Oldest {
                inner.queue.pop_front();
            } else {
                return false;
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        inner.queue.push_back(LogEntry {
            run_id: self.run_id.clone(),
            channel,
            content,
            seq,
            ts_ms,
        });
        inner.stats.total_queued += 1;
        true
    }

    /// Send up to `batch_size` queued entries, retrying
    /// `config.max_retries` times with `config.retry_delay` between
    /// attempts before giving up on the batch (spec.md §4.9 item 1).
    pub async fn flush(&self) -> Result<usize, antcode_backends::log_storage::LogStorageError> {
        let batch = {
            let mut inner = self.inner.lock().await;
            let take = inner.queue.len().min(self.config.batch_size);
            inner.queue.drain(..take).collect::<Vec<_>>()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let sent = batch.len();

        let mut last_err = None;
        for attempt in 0..self.config.max_retries.max(1) {
            match self.backend.write_log_batch(batch.clone()).await {
                Ok(()) => {
                    self.inner.lock().await.stats.total_sent += sent as u64;
                    return Ok(sent);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        self.inner.lock().await.stats.total_failed += sent as u64;
        Err(last_err.expect("loop runs at least once"))
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

/// Durable channel: buffers bytes into 64 KiB chunks with monotonic offsets
/// and a running SHA-256, so the receiving backend can resume from the last
/// acknowledged offset on reconnect (spec.md §4.9 item 2).
pub struct LogArchiver<L> {
    run_id: String,
    channel: LogChannel,
    backend: Arc<L>,
    chunk_size: usize,
    buffer: Vec<u8>,
    offset: u64,
    hasher: Sha256,
}

impl<L: LogStorageBackend> LogArchiver<L> {
    pub fn new(run_id: impl Into<String>, channel: LogChannel, backend: Arc<L>, chunk_size: usize) -> Self {
        Self {
            run_id: run_id.into(),
            channel,
            backend,
            chunk_size,
            buffer: Vec::new(),
            offset: 0,
            hasher: Sha256::new(),
        }
    }

    /// Append bytes, flushing complete 64 KiB chunks as they fill.
    pub async fn append(
        &mut self,
        data: &[u8],
    ) -> Result<(), antcode_backends::log_storage::LogStorageError> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.chunk_size {
            let chunk_bytes: Vec<u8> = self.buffer.drain(..self.chunk_size).collect();
            self.flush_chunk(chunk_bytes).await?;
        }
        Ok(())
    }

    async fn flush_chunk(
        &mut self,
        chunk_bytes: Vec<u8>,
    ) -> Result<(), antcode_backends::log_storage::LogStorageError> {
        self.hasher.update(&chunk_bytes);
        let running = hex::encode(self.hasher.clone().finalize());
        let next_offset = self
            .backend
            .write_chunk(LogChunk {
                run_id: self.run_id.clone(),
                channel: self.channel,
                offset: self.offset,
                data: chunk_bytes.clone(),
                running_sha256: running,
            })
            .await?;
        self.offset = next_offset.max(self.offset + chunk_bytes.len() as u64);
        Ok(())
    }

    /// Flush whatever remains as a final, possibly-short chunk, then assert
    /// total length and checksum so the backend merges and compresses.
    pub async fn finalize(
        mut self,
    ) -> Result<(), antcode_backends::log_storage::LogStorageError> {
        if !self.buffer.is_empty() {
            let remaining = std::mem::take(&mut self.buffer);
            self.flush_chunk(remaining).await?;
        }
        let checksum = hex::encode(self.hasher.finalize());
        self.backend
            .finalize_chunks(&self.run_id, self.channel, self.offset, &checksum)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_backends::memory::InMemoryLogStorage;

    #[tokio::test]
    async fn write_queues_and_flush_sends_to_backend() {
        let backend = Arc::new(InMemoryLogStorage::default());
        let sender = BatchSender::new("run-1", backend.clone(), BatchConfig::default());

        assert!(sender.write(LogChannel::Stdout, "hello".into(), 1).await);
        assert_eq!(sender.queue_len().await, 1);

        let sent = sender.flush().await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(sender.queue_len().await, 0);
    }

    #[tokio::test]
    async fn backpressure_blocks_once_queue_is_full() {
        let backend = Arc::new(InMemoryLogStorage::default());
        let config = BatchConfig {
            batch_size: 1,
            max_queue_size: 2,
            drop_on_critical: false,
            drop_priority: DropPriority::Oldest,
            ..BatchConfig::default()
        };
        let sender = BatchSender::new("run-1", backend, config);

        assert!(sender.write(LogChannel::Stdout, "a".into(), 1).await);
        assert!(sender.write(LogChannel::Stdout, "b".into(), 2).await);
        // Queue is now at the configured max (ratio 1.0) => blocked.
        assert!(!sender.write(LogChannel::Stdout, "c".into(), 3).await);
    }

    #[tokio::test]
    async fn archiver_finalizes_with_correct_checksum() {
        let backend = Arc::new(InMemoryLogStorage::default());
        let mut archiver = LogArchiver::new("run-1", LogChannel::Stdout, backend.clone(), 4);
        archiver.append(b"abcdefgh").await.unwrap();
        archiver.finalize().await.unwrap();

        let stored = backend.get_log_stream("run-1", LogChannel::Stdout).await.unwrap();
        assert_eq!(stored, b"abcdefgh");
    }
}
