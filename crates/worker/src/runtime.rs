// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Content-addressed runtime preparation with single-builder guarantees
//! (spec.md §4.7). `RuntimeManager` hashes a spec, serializes concurrent
//! builders of the same hash behind a per-hash lock, and reuses an existing
//! `venvs/{hash}/` directory when its build manifest is complete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use antcode_core::model::{RuntimeHandle, RuntimeScope, RuntimeSpec};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("timed out waiting for the build lock on runtime {0}")]
    LockTimeout(String),
    #[error("build failed for runtime {hash}: {source}")]
    Build {
        hash: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("filesystem error preparing runtime {hash}: {source}")]
    Io {
        hash: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    complete: bool,
    python_executable: PathBuf,
    created_at_ms: u64,
}

/// Builds a venv for a spec into `venv_dir`. Implementations install
/// dependencies via the preferred package installer; the in-memory test
/// double just creates marker files.
#[async_trait::async_trait]
pub trait RuntimeBuilder: Send + Sync {
    async fn build(
        &self,
        spec: &RuntimeSpec,
        venv_dir: &Path,
    ) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>>;
}

/// Tracks usage counts and per-hash build locks across `prepare`/`release`
/// calls on one Worker process.
pub struct RuntimeManager<B> {
    venvs_dir: PathBuf,
    builder: B,
    lock_timeout: Duration,
    gc_ttl: Duration,
    max_retained: usize,
    locks: Mutex<std::collections::HashMap<String, Arc<Mutex<()>>>>,
    usage_count: Mutex<std::collections::HashMap<String, u32>>,
    clock: Arc<dyn antcode_core::clock::Clock>,
}

impl<B: RuntimeBuilder> RuntimeManager<B> {
    pub fn new(
        venvs_dir: impl Into<PathBuf>,
        builder: B,
        clock: Arc<dyn antcode_core::clock::Clock>,
    ) -> Self {
        Self {
            venvs_dir: venvs_dir.into(),
            builder,
            lock_timeout: Duration::from_secs(600),
            gc_ttl: Duration::from_secs(7 * 24 * 3600),
            max_retained: 64,
            locks: Mutex::new(std::collections::HashMap::new()),
            usage_count: Mutex::new(std::collections::HashMap::new()),
            clock,
        }
    }

    pub fn with_gc_ttl(mut self, ttl: Duration) -> Self {
        self.gc_ttl = ttl;
        self
    }

    pub fn with_max_retained(mut self, max_retained: usize) -> Self {
        self.max_retained = max_retained;
        self
    }

    async fn hash_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn venv_dir(&self, hash: &str) -> PathBuf {
        self.venvs_dir.join(hash)
    }

    fn manifest_path(&self, hash: &str) -> PathBuf {
        self.venv_dir(hash).join(MANIFEST_FILE)
    }

    fn read_manifest(&self, hash: &str) -> Option<Manifest> {
        let content = std::fs::read_to_string(self.manifest_path(hash)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Compute the spec's hash, acquire its per-hash lock, reuse an existing
    /// complete build or build a new one, and bump the usage count.
    pub async fn prepare(&self, spec: &RuntimeSpec) -> Result<RuntimeHandle, RuntimeError> {
        let hash = spec.runtime_hash();
        let lock = self.hash_lock(&hash).await;

        let guard = tokio::time::timeout(self.lock_timeout, lock.lock())
            .await
            .map_err(|_| RuntimeError::LockTimeout(hash.clone()))?;

        if let Some(manifest) = self.read_manifest(&hash) {
            if manifest.complete && manifest.python_executable.exists() {
                drop(guard);
                *self.usage_count.lock().await.entry(hash.clone()).or_insert(0) += 1;
                return Ok(RuntimeHandle {
                    hash: hash.clone(),
                    path: self.venv_dir(&hash),
                    python_executable: manifest.python_executable,
                    scope: RuntimeScope::Shared,
                });
            }
        }

        let venv_dir = self.venv_dir(&hash);
        std::fs::create_dir_all(&venv_dir).map_err(|source| RuntimeError::Io {
            hash: hash.clone(),
            source,
        })?;

        let build_result = self.builder.build(spec, &venv_dir).await;
        let python_executable = match build_result {
            Ok(path) => path,
            Err(source) => {
                // Partial state is deleted before releasing the lock (spec.md §4.7).
                let _ = std::fs::remove_dir_all(&venv_dir);
                return Err(RuntimeError::Build { hash, source });
            }
        };

        let manifest = Manifest {
            complete: true,
            python_executable: python_executable.clone(),
            created_at_ms: self.clock.epoch_ms(),
        };
        let encoded = serde_json::to_vec_pretty(&manifest).unwrap_or_default();
        std::fs::write(self.manifest_path(&hash), encoded).map_err(|source| RuntimeError::Io {
            hash: hash.clone(),
            source,
        })?;

        drop(guard);
        *self.usage_count.lock().await.entry(hash.clone()).or_insert(0) += 1;

        Ok(RuntimeHandle {
            hash: hash.clone(),
            path: venv_dir,
            python_executable,
            scope: RuntimeScope::Shared,
        })
    }

    /// Decrement the usage count; does not touch disk.
    pub async fn release(&self, handle: &RuntimeHandle) {
        let mut counts = self.usage_count.lock().await;
        if let Some(count) = counts.get_mut(&handle.hash) {
            *count = count.saturating_sub(1);
        }
    }

    /// Reclaim runtimes whose last-used time exceeds the GC TTL and whose
    /// usage count is zero, oldest first, bounded to `max_retained`
    /// reclamations per pass.
    pub async fn run_gc(&self) -> Result<Vec<String>, RuntimeError> {
        let counts = self.usage_count.lock().await;
        let mut candidates = Vec::new();

        let entries = match std::fs::read_dir(&self.venvs_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        for entry in entries.flatten() {
            let Some(hash) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if counts.get(&hash).copied().unwrap_or(0) > 0 {
                continue;
            }
            let Some(manifest) = self.read_manifest(&hash) else {
                continue;
            };
            let age_ms = self.clock.epoch_ms().saturating_sub(manifest.created_at_ms);
            if age_ms > self.gc_ttl.as_millis() as u64 {
                candidates.push((hash, manifest.created_at_ms));
            }
        }
        drop(counts);

        // Oldest first, so if more qualify than `max_retained` allows we
        // reclaim the least-recently-built ones first.
        candidates.sort_by_key(|(_, created)| *created);
        let mut reclaimed = Vec::new();
        for (hash, _) in candidates.into_iter().take(self.max_retained.max(1)) {
            if std::fs::remove_dir_all(self.venv_dir(&hash)).is_ok() {
                reclaimed.push(hash);
            }
        }
        Ok(reclaimed)
    }

    /// Build the environment a prepared runtime contributes on top of the
    /// task's own requested variables (non-deterministic fields merge in
    /// at use time, never at hash time — spec.md §4.7).
    pub fn merged_env(spec: &RuntimeSpec, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = spec.env_vars.clone();
        env.extend(extra.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::clock::FakeClock;
    use antcode_core::model::{LockSource, PythonSpec};

    struct FakeBuilder;

    #[async_trait::async_trait]
    impl RuntimeBuilder for FakeBuilder {
        async fn build(
            &self,
            _spec: &RuntimeSpec,
            venv_dir: &Path,
        ) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
            let python = venv_dir.join("bin").join("python3");
            std::fs::create_dir_all(python.parent().unwrap())?;
            std::fs::write(&python, b"")?;
            Ok(python)
        }
    }

    fn spec() -> RuntimeSpec {
        RuntimeSpec {
            python: PythonSpec {
                version: Some("3.11".into()),
                path: None,
            },
            lock_source: LockSource::Requirements {
                requirements: vec!["requests==2.31".into()],
            },
            constraints: vec![],
            extras: vec![],
            env_vars: Default::default(),
            secret_refs: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn prepare_builds_once_and_reuses_on_second_call() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1_000));
        let manager = RuntimeManager::new(dir.path(), FakeBuilder, clock);

        let handle1 = manager.prepare(&spec()).await.unwrap();
        assert!(handle1.python_executable.exists());

        let handle2 = manager.prepare(&spec()).await.unwrap();
        assert_eq!(handle1.hash, handle2.hash);
        assert_eq!(handle1.path, handle2.path);
    }

    #[tokio::test]
    async fn release_does_not_delete_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1_000));
        let manager = RuntimeManager::new(dir.path(), FakeBuilder, clock);

        let handle = manager.prepare(&spec()).await.unwrap();
        manager.release(&handle).await;
        assert!(handle.path.exists());
    }

    #[tokio::test]
    async fn gc_reclaims_unused_runtime_past_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let manager = RuntimeManager::new(dir.path(), FakeBuilder, clock.clone())
            .with_gc_ttl(Duration::from_secs(60));

        let handle = manager.prepare(&spec()).await.unwrap();
        manager.release(&handle).await;

        clock.advance_ms(120_000);
        let reclaimed = manager.run_gc().await.unwrap();
        assert_eq!(reclaimed, vec![handle.hash]);
        assert!(!handle.path.exists());
    }

    #[tokio::test]
    async fn gc_skips_runtime_still_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let manager = RuntimeManager::new(dir.path(), FakeBuilder, clock.clone())
            .with_gc_ttl(Duration::from_secs(60));

        let handle = manager.prepare(&spec()).await.unwrap();
        clock.advance_ms(120_000);
        let reclaimed = manager.run_gc().await.unwrap();
        assert!(reclaimed.is_empty());
        assert!(handle.path.exists());
    }
}
