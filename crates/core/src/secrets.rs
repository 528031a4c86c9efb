// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Secrets directory resolution (spec.md §6): file contents win over the
//! `ANTCODE_`-prefixed environment fallback, which wins over a default.

use std::path::{Path, PathBuf};

use crate::config::EnvSource;

/// Recognized secret keys; the file base name under the secrets directory.
pub const SECRET_KEYS: &[&str] = &[
    "api_key",
    "ca.crt",
    "client.crt",
    "client.key",
    "gateway_token",
    "redis_password",
];

pub struct SecretsDir {
    dir: PathBuf,
}

impl SecretsDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve `key`: file content (trimmed of trailing newline) if the file
    /// exists; else `ANTCODE_{KEY_UPPER}` from `env`; else `default`.
    pub fn resolve(&self, key: &str, env: &EnvSource, default: Option<&str>) -> Option<String> {
        let path = self.path_for(key);
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content.trim_end_matches(['\n', '\r']).to_string());
        }
        let env_key = format!("ANTCODE_{}", key.to_uppercase().replace('.', "_"));
        if let Some(value) = env.get(&env_key) {
            return Some(value.to_string());
        }
        default.map(str::to_string)
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env_with(pairs: &[(&str, &str)]) -> EnvSource {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvSource::from_map(vars)
    }

    #[test]
    fn file_content_wins_over_env_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api_key"), "from-file\n").unwrap();
        let env = env_with(&[("ANTCODE_API_KEY", "from-env")]);
        let secrets = SecretsDir::new(dir.path());
        assert_eq!(secrets.resolve("api_key", &env, None), Some("from-file".to_string()));
    }

    #[test]
    fn env_fallback_used_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_with(&[("ANTCODE_GATEWAY_TOKEN", "from-env")]);
        let secrets = SecretsDir::new(dir.path());
        assert_eq!(
            secrets.resolve("gateway_token", &env, None),
            Some("from-env".to_string())
        );
    }

    #[test]
    fn default_used_when_neither_file_nor_env_present() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_with(&[]);
        let secrets = SecretsDir::new(dir.path());
        assert_eq!(
            secrets.resolve("redis_password", &env, Some("fallback")),
            Some("fallback".to_string())
        );
    }
}
