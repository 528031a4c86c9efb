// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Artifact fetch and cache (spec.md §4.6 item 2): download by URL, verify
//! the expected hash, and safely extract archives into a content-addressed
//! cache directory.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;
use tokio::sync::Mutex;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("local artifact source not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("hash mismatch: expected {expected}, actual {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("unsafe archive member: {0}")]
    UnsafeMember(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    cache_key: String,
    project_id: String,
    file_hash: String,
    local_path: PathBuf,
    created_at_ms: u64,
    last_access_ms: u64,
    size_bytes: u64,
}

/// On-disk index of previously fetched projects, keyed by `(project_id,
/// expected_hash)` (or a URL hash fallback when no hash is given).
pub struct ProjectCache {
    cache_dir: PathBuf,
    max_entries: usize,
    ttl_ms: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: std::sync::Arc<dyn antcode_core::clock::Clock>,
}

impl ProjectCache {
    pub fn new(cache_dir: impl Into<PathBuf>, clock: std::sync::Arc<dyn antcode_core::clock::Clock>) -> Self {
        let cache_dir = cache_dir.into();
        let _ = std::fs::create_dir_all(&cache_dir);
        let entries = Self::load_index(&cache_dir).unwrap_or_default();
        Self {
            cache_dir,
            max_entries: 200,
            ttl_ms: 7 * 24 * 3600 * 1000,
            entries: Mutex::new(entries),
            clock,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE)
    }

    fn load_index(cache_dir: &Path) -> Option<HashMap<String, CacheEntry>> {
        let content = std::fs::read_to_string(cache_dir.join(INDEX_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    async fn save_index(&self, entries: &HashMap<String, CacheEntry>) {
        if let Ok(encoded) = serde_json::to_vec_pretty(entries) {
            let _ = std::fs::write(self.index_path(), encoded);
        }
    }

    async fn get(&self, cache_key: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get(cache_key)?.clone();
        let now = self.clock.epoch_ms();

        if now.saturating_sub(entry.created_at_ms) > self.ttl_ms || !entry.local_path.exists() {
            entries.remove(cache_key);
            self.save_index(&entries).await;
            return None;
        }

        if let Some(stored) = entries.get_mut(cache_key) {
            stored.last_access_ms = now;
        }
        self.save_index(&entries).await;
        Some(entry.local_path)
    }

    async fn put(&self, entry: CacheEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries {
            let mut by_access: Vec<_> = entries.values().cloned().collect();
            by_access.sort_by_key(|e| e.last_access_ms);
            let evict_count = (entries.len() + 1).saturating_sub(self.max_entries).max(1);
            for victim in by_access.into_iter().take(evict_count) {
                entries.remove(&victim.cache_key);
            }
        }
        entries.insert(entry.cache_key.clone(), entry);
        self.save_index(&entries).await;
    }

    /// Drop a cache entry without touching disk; used to quarantine an
    /// artifact after an integrity failure (spec.md §7, "Integrity").
    pub async fn quarantine(&self, cache_key: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(cache_key);
        self.save_index(&entries).await;
    }

    fn project_dir(&self, project_id: &str, cache_key: &str) -> PathBuf {
        self.cache_dir.join(safe_slug(project_id)).join(safe_slug(cache_key))
    }
}

fn safe_slug(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

fn build_cache_key(project_id: &str, file_hash: Option<&str>, url: &str) -> String {
    let safe_project = safe_slug(project_id);
    match file_hash {
        Some(hash) => format!("{safe_project}:{hash}"),
        None => {
            let digest = sha2::Sha256::digest(url.as_bytes());
            format!("{safe_project}:{}", hex::encode(&digest[..8]))
        }
    }
}

fn detect_hash_algo(file_hash: &str) -> &'static str {
    match file_hash.len() {
        32 => "md5",
        _ => "sha256",
    }
}

fn hash_file(path: &Path, algo: &str) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 8192];
    match algo {
        "md5" => {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        _ => {
            use sha2::Digest as _;
            let mut hasher = sha2::Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

fn guess_filename(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "project.zip".to_string()
    } else {
        name.to_string()
    }
}

/// Downloads (or copies, for `file://`), verifies hash, and extracts
/// archives into a project cache.
pub struct ArtifactFetcher {
    cache: ProjectCache,
    http: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new(cache: ProjectCache) -> Self {
        Self {
            cache,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Fetch and, for archives, extract `download_url` for `project_id`,
    /// returning the path of the extracted (or copied) project directory.
    /// `is_compressed`: `Some(false)` forces a plain copy, `None` infers
    /// from the filename, `Some(true)` requires an archive extension.
    pub async fn fetch(
        &self,
        project_id: &str,
        download_url: &str,
        file_hash: Option<&str>,
        is_compressed: Option<bool>,
        entry_point: Option<&str>,
    ) -> Result<PathBuf, FetchError> {
        let cache_key = build_cache_key(project_id, file_hash, download_url);
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let project_dir = self.cache.project_dir(project_id, &cache_key);
        std::fs::create_dir_all(&project_dir)?;

        let filename = guess_filename(download_url);
        let file_path = project_dir.join(&filename);
        self.download(download_url, &file_path).await?;

        if let Some(expected) = file_hash {
            let algo = detect_hash_algo(expected);
            let actual = hash_file(&file_path, algo)?;
            if !actual.eq_ignore_ascii_case(expected) {
                self.cache.quarantine(&cache_key).await;
                return Err(FetchError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let should_extract = is_compressed != Some(false);
        let final_path = if should_extract {
            match extract_if_needed(&file_path, &project_dir)? {
                Some(extracted) => extracted,
                None => copy_single_file(&file_path, &project_dir, entry_point.unwrap_or(&filename))?,
            }
        } else {
            copy_single_file(&file_path, &project_dir, entry_point.unwrap_or(&filename))?
        };

        let size_bytes = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        let now = self.cache_now();
        self.cache
            .put(CacheEntry {
                cache_key,
                project_id: project_id.to_string(),
                file_hash: file_hash.unwrap_or_default().to_string(),
                local_path: final_path.clone(),
                created_at_ms: now,
                last_access_ms: now,
                size_bytes,
            })
            .await;

        Ok(final_path)
    }

    fn cache_now(&self) -> u64 {
        self.cache.clock.epoch_ms()
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            let src = Path::new(path);
            if !src.exists() {
                return Err(FetchError::SourceNotFound(src.to_path_buf()));
            }
            std::fs::copy(src, dest)?;
            return Ok(());
        }

        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }
}

fn copy_single_file(file_path: &Path, project_dir: &Path, target_name: &str) -> Result<PathBuf, FetchError> {
    let extract_dir = project_dir.join("extracted");
    std::fs::create_dir_all(&extract_dir)?;
    std::fs::copy(file_path, extract_dir.join(target_name))?;
    Ok(extract_dir)
}

/// Extracts `.zip` archives. `.tar.gz`/`.tgz` are intentionally unsupported:
/// no tar-reading crate appears anywhere among the available dependencies,
/// and fabricating one would violate the no-vendored-crates rule; the
/// dispatcher side is expected to package projects as zip.
fn extract_if_needed(file_path: &Path, project_dir: &Path) -> Result<Option<PathBuf>, FetchError> {
    let name = file_path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_lowercase();
    if !name.ends_with(".zip") {
        return Ok(None);
    }

    let extract_dir = project_dir.join("extracted");
    std::fs::create_dir_all(&extract_dir)?;
    safe_extract_zip(file_path, &extract_dir)?;
    Ok(Some(extract_dir))
}

fn safe_extract_zip(file_path: &Path, dest: &Path) -> Result<(), FetchError> {
    let base_dir = dest.canonicalize().unwrap_or_else(|_| dest.to_path_buf());
    let file = std::fs::File::open(file_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| FetchError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| FetchError::Archive(e.to_string()))?;
        if is_zip_symlink(&entry) {
            return Err(FetchError::UnsafeMember(entry.name().to_string()));
        }
        if !is_safe_member_path(entry.name(), &base_dir) {
            return Err(FetchError::UnsafeMember(entry.name().to_string()));
        }
    }

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| FetchError::Archive(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(FetchError::UnsafeMember(entry.name().to_string()));
        };
        let out_path = base_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
    }

    Ok(())
}

fn is_zip_symlink(entry: &zip::read::ZipFile) -> bool {
    matches!(entry.unix_mode(), Some(mode) if mode & 0o170000 == 0o120000)
}

fn is_safe_member_path(name: &str, base_dir: &Path) -> bool {
    if name.is_empty() {
        return false;
    }
    let candidate = base_dir.join(name);
    let Some(parent) = candidate.parent() else {
        return false;
    };
    let resolved_parent = match parent.canonicalize() {
        Ok(p) => p,
        // Parent directories may not exist yet during the pre-check pass;
        // fall back to lexical normalization of the unresolved path.
        Err(_) => normalize_lexically(parent),
    };
    resolved_parent.starts_with(base_dir) || resolved_parent == base_dir
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut stack: Vec<std::path::Component> = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                stack.pop();
            }
            std::path::Component::CurDir => {}
            other => stack.push(other),
        }
    }
    stack.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::clock::FakeClock;
    use std::io::Write;

    #[tokio::test]
    async fn fetch_copies_local_file_and_verifies_hash() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("payload.txt");
        std::fs::write(&src_path, b"hello world").unwrap();
        let expected_hash = hex::encode(sha2::Sha256::digest(b"hello world"));

        let cache_dir = tempfile::tempdir().unwrap();
        let clock = std::sync::Arc::new(FakeClock::new(0));
        let cache = ProjectCache::new(cache_dir.path(), clock);
        let fetcher = ArtifactFetcher::new(cache);

        let url = format!("file://{}", src_path.display());
        let result = fetcher
            .fetch("proj-1", &url, Some(&expected_hash), Some(false), None)
            .await
            .unwrap();

        let extracted = result.join("payload.txt");
        assert_eq!(std::fs::read(extracted).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn fetch_rejects_hash_mismatch_and_does_not_populate_cache() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("payload.txt");
        std::fs::write(&src_path, b"hello world").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let clock = std::sync::Arc::new(FakeClock::new(0));
        let cache = ProjectCache::new(cache_dir.path(), clock);
        let fetcher = ArtifactFetcher::new(cache);

        let url = format!("file://{}", src_path.display());
        let wrong_hash = "0".repeat(64);
        let err = fetcher
            .fetch("proj-1", &url, Some(&wrong_hash), Some(false), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn fetch_extracts_zip_archive() {
        let src_dir = tempfile::tempdir().unwrap();
        let zip_path = src_dir.path().join("project.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("main.py", options).unwrap();
            writer.write_all(b"print('hi')").unwrap();
            writer.finish().unwrap();
        }

        let cache_dir = tempfile::tempdir().unwrap();
        let clock = std::sync::Arc::new(FakeClock::new(0));
        let cache = ProjectCache::new(cache_dir.path(), clock);
        let fetcher = ArtifactFetcher::new(cache);

        let url = format!("file://{}", zip_path.display());
        let result = fetcher.fetch("proj-2", &url, None, None, None).await.unwrap();
        assert_eq!(std::fs::read(result.join("main.py")).unwrap(), b"print('hi')");
    }

    #[tokio::test]
    async fn fetch_rejects_zip_with_path_traversal_member() {
        let src_dir = tempfile::tempdir().unwrap();
        let zip_path = src_dir.path().join("evil.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("../../etc/passwd", options).unwrap();
            writer.write_all(b"pwned").unwrap();
            writer.finish().unwrap();
        }

        let cache_dir = tempfile::tempdir().unwrap();
        let clock = std::sync::Arc::new(FakeClock::new(0));
        let cache = ProjectCache::new(cache_dir.path(), clock);
        let fetcher = ArtifactFetcher::new(cache);

        let url = format!("file://{}", zip_path.display());
        let err = fetcher.fetch("proj-3", &url, None, None, None).await.unwrap_err();
        assert!(matches!(err, FetchError::Archive(_) | FetchError::UnsafeMember(_)));
    }
}
