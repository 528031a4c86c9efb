// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! DedupStore: a URL-fingerprint set per project (spec.md §4.10).

use async_trait::async_trait;
use md5::{Digest, Md5};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("transport error: {0}")]
    Transport(String),
}

pub type DedupResult<T> = Result<T, DedupError>;

/// MD5 over the trimmed URL, as the spec's fingerprint function.
pub fn fingerprint(url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// A per-project set of seen URL fingerprints. `add` must be atomic: no
/// lost updates under concurrent adders for the same project.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn ensure_store(&self, project_id: &str, capacity: u64, error_rate: f64) -> DedupResult<()>;
    async fn exists(&self, project_id: &str, fp: &str) -> DedupResult<bool>;
    /// Returns `true` the first time `fp` is added for this project, `false`
    /// on every subsequent call.
    async fn add(&self, project_id: &str, fp: &str) -> DedupResult<bool>;
    async fn exists_many(&self, project_id: &str, fps: &[String]) -> DedupResult<Vec<bool>>;
    async fn add_many(&self, project_id: &str, fps: &[String]) -> DedupResult<Vec<bool>>;
    async fn size(&self, project_id: &str) -> DedupResult<u64>;
    async fn clear(&self, project_id: &str) -> DedupResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_trims_surrounding_whitespace() {
        assert_eq!(fingerprint("  http://a.example/x "), fingerprint("http://a.example/x"));
    }

    #[test]
    fn fingerprint_distinguishes_different_urls() {
        assert_ne!(fingerprint("http://a.example/x"), fingerprint("http://a.example/y"));
    }
}
