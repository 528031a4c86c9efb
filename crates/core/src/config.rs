// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process configuration: environment variables plus an optional `.env`
//! file, merged with process env taking priority (spec.md §6).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// A flat key-value environment view, layering `.env` under the live
/// process environment. Narrower than [`Config`]: used by callers (like
/// [`crate::secrets::SecretsDir`]) that need a single named value rather
/// than the whole assembled config.
pub struct EnvSource {
    vars: BTreeMap<String, String>,
}

impl EnvSource {
    /// Loads `.env` (if present) into the process environment via
    /// `dotenvy`, then snapshots the resulting environment.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a source directly from a map, bypassing the process
    /// environment and `.env` file. Used by tests of downstream consumers.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Which pluggable implementation each abstraction (spec.md §4.10) uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

/// Top-level control-plane configuration, assembled from `ANTCODE_*`
/// environment variables (and an optional `.env` file) the way the
/// teacher's `daemon::lifecycle::Config::load` assembles a single config
/// value from environment/XDG paths.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub redis_namespace: Option<String>,
    pub gateway_host: String,
    pub gateway_port: u16,
    /// Base URL of the external project catalog that resolves a
    /// `project_id` to its artifact location (spec.md §3: owned outside
    /// this control plane).
    pub project_catalog_url: String,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_offline_threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub task_timeout_ceiling: Duration,
    pub log_chunk_bytes: u64,
    pub log_retention_days: u32,
    pub queue_backend: BackendKind,
    pub dedup_backend: BackendKind,
    pub progress_backend: BackendKind,
    pub log_backend: BackendKind,
}

impl Config {
    /// Loads `.env` (if present) into the process environment, then layers
    /// `ANTCODE_*` environment variables over the defaults below into an
    /// immutable `Config` value, one per binary, at boot.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let cfg = Self::builder()?
            .add_source(config::Environment::with_prefix("ANTCODE").try_parsing(true))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Test-only seam: build from an explicit key-value map instead of the
    /// real process environment/`.env` file.
    pub fn from_map(vars: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder()?;
        for (key, value) in vars {
            builder = builder.set_override(key, value)?;
        }
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Defaults shared by every config source, matching spec.md §6.
    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("gateway_host", "0.0.0.0")?
            .set_default("gateway_port", 7443)?
            .set_default("project_catalog_url", "http://127.0.0.1:8090")?
            .set_default("heartbeat_interval", "15s")?
            .set_default("heartbeat_offline_threshold", "60s")?
            .set_default("task_timeout_ceiling", "3600s")?
            .set_default("log_chunk_bytes", 65_536)?
            .set_default("log_retention_days", 30)?
            .set_default("queue_backend", "redis")?
            .set_default("dedup_backend", "redis")?
            .set_default("progress_backend", "redis")?
            .set_default("log_backend", "redis")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn from_map_applies_defaults_for_unset_fields() {
        let cfg = Config::from_map(map(&[("database_url", "postgres://x")])).unwrap();
        assert_eq!(cfg.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.gateway_port, 7443);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.queue_backend, BackendKind::Redis);
    }

    #[test]
    fn from_map_overrides_defaults_and_parses_durations() {
        let cfg = Config::from_map(map(&[
            ("database_url", "postgres://x"),
            ("gateway_port", "9000"),
            ("heartbeat_interval", "5s"),
            ("queue_backend", "memory"),
        ]))
        .unwrap();
        assert_eq!(cfg.gateway_port, 9000);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.queue_backend, BackendKind::Memory);
    }

    #[test]
    fn from_map_rejects_unknown_backend_kind() {
        let err = Config::from_map(map(&[("database_url", "postgres://x"), ("queue_backend", "mongo")]));
        assert!(err.is_err());
    }

    #[test]
    fn from_map_requires_database_url() {
        let err = Config::from_map(map(&[]));
        assert!(err.is_err());
    }

    #[test]
    fn env_source_from_map_reads_back_values() {
        let env = EnvSource::from_map(map(&[("FOO", "bar")]));
        assert_eq!(env.get("FOO"), Some("bar"));
        assert_eq!(env.get("MISSING"), None);
    }
}
