// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared by Master, Gateway, and Worker.
//!
//! Each variant maps onto the retry/propagation rule for its kind: what is
//! safe to retry with backoff, what is non-retryable and terminates a run,
//! and what is a silent no-op rather than a surfaced failure.

use thiserror::Error;

/// A control-plane error, classified by the handling its kind requires.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Network error, Redis unavailable, Gateway 5xx. Retry with backoff;
    /// surfaces as degraded health, never as a terminal TaskRun failure.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Invalid API key, expired signature, replayed nonce, unknown Worker.
    /// Non-retryable; surfaced to the audit channel.
    #[error("authentication/authorization failure: {0}")]
    Unauthorized(String),

    /// Malformed payload, missing entry point, bad runtime spec.
    /// Non-retryable; the run terminates `failed` with this message.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout, memory/cpu limit exceeded, disk full. Retryable by the
    /// task's own retry policy; distinct from a crash.
    #[error("resource limit exceeded: {0}")]
    Resource(String),

    /// Artifact hash mismatch, archive traversal attempt, checksum failure.
    /// Non-retryable; quarantines the artifact cache entry.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Runtime dependency resolution failure. Retryable only when the
    /// underlying cause is transient network error.
    #[error("runtime build failure: {0}")]
    Build(String),

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ControlError {
    /// Whether a caller should retry this error with backoff, per the
    /// taxonomy's propagation rule. `Build` requires its own transient
    /// check at the call site; it is conservatively `false` here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Transient(_) | ControlError::Resource(_))
    }
}

/// Internal invariant violations (e.g. a stale state transition) are never
/// constructed as errors — they are silent no-ops at the call site. This
/// marker type documents the rule at the one place callers might be
/// tempted to treat a rejected `bool` return as an error.
pub struct SilentNoOp;

pub type ControlResult<T> = Result<T, ControlError>;
