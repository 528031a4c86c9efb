// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! LogStorageBackend: durable log persistence, independent of the live
//! Redis-stream channel (spec.md §4.9, §4.10).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogStorageError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("checksum mismatch for run {run_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LogStorageResult<T> = Result<T, LogStorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: String,
    pub channel: LogChannel,
    pub content: String,
    pub seq: u64,
    pub ts_ms: u64,
}

/// One 64 KiB-bounded slice of the durable channel, carrying a running hash
/// over everything written for this run so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub run_id: String,
    pub channel: LogChannel,
    pub offset: u64,
    pub data: Vec<u8>,
    pub running_sha256: String,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: Option<String>,
}

#[async_trait]
pub trait LogStorageBackend: Send + Sync {
    async fn write_log(&self, entry: LogEntry) -> LogStorageResult<()>;
    async fn write_log_batch(&self, entries: Vec<LogEntry>) -> LogStorageResult<()>;

    /// Append one chunk; returns the next offset the caller should send,
    /// allowing the archiver to resume after a reconnect.
    async fn write_chunk(&self, chunk: LogChunk) -> LogStorageResult<u64>;

    /// Merge, gzip-compress, and store under a stable key once the caller
    /// asserts the total size and SHA-256 of the concatenated chunks.
    async fn finalize_chunks(
        &self,
        run_id: &str,
        channel: LogChannel,
        total_size: u64,
        checksum: &str,
    ) -> LogStorageResult<()>;

    async fn query_logs(
        &self,
        run_id: &str,
        channel: Option<LogChannel>,
        start_seq: u64,
        limit: u32,
    ) -> LogStorageResult<Vec<LogEntry>>;

    async fn get_log_stream(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<Vec<u8>>;

    async fn delete_logs(&self, run_id: &str) -> LogStorageResult<()>;

    async fn get_presigned_upload_url(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<String>;
    async fn get_presigned_download_url(&self, run_id: &str, channel: LogChannel) -> LogStorageResult<String>;

    async fn health_check(&self) -> LogStorageResult<HealthStatus>;
}
