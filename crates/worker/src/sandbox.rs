// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sandbox providers wrapped around `ProcessExecutor` (spec.md §4.8):
//! `NoOpSandbox` passes everything through, `BasicSandbox` filters the
//! environment and isolates a per-run working directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Substrings that disqualify an environment variable key from the
/// allowlist, regardless of whether the key itself is allowlisted.
const BLOCKED_KEY_SUBSTRINGS: &[&str] = &[
    "SECRET",
    "PASSWORD",
    "TOKEN",
    "API_KEY",
    "CREDENTIAL",
    "PRIVATE",
];

/// A prepared sandbox: the command prefix to prepend (if any), the filtered
/// environment, and the working directory the process should run in.
pub struct SandboxPlan {
    pub prefix: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    /// Present when `BasicSandbox` allocated a scratch directory that must
    /// be removed after the run.
    pub cleanup_dir: Option<PathBuf>,
}

pub trait SandboxProvider: Send + Sync {
    fn prepare(&self, base_cwd: &std::path::Path, env: &BTreeMap<String, String>) -> SandboxPlan;
}

/// Passes the command and environment through unmodified.
pub struct NoOpSandbox;

impl SandboxProvider for NoOpSandbox {
    fn prepare(&self, base_cwd: &std::path::Path, env: &BTreeMap<String, String>) -> SandboxPlan {
        SandboxPlan {
            prefix: Vec::new(),
            env: env.clone(),
            cwd: base_cwd.to_path_buf(),
            cleanup_dir: None,
        }
    }
}

/// Filters environment variables to an allowlist, refuses blocked-substring
/// keys regardless, optionally runs in a temporary per-run directory, and
/// optionally wraps the command with a host-provided sandbox prefix
/// (e.g. `firejail`, `bwrap`).
pub struct BasicSandbox {
    allowlist: std::collections::BTreeSet<String>,
    command_prefix: Vec<String>,
    use_temp_dir: bool,
}

impl BasicSandbox {
    pub fn new(allowlist: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowlist: allowlist.into_iter().collect(),
            command_prefix: Vec::new(),
            use_temp_dir: false,
        }
    }

    pub fn with_command_prefix(mut self, prefix: Vec<String>) -> Self {
        self.command_prefix = prefix;
        self
    }

    pub fn with_temp_dir(mut self, enabled: bool) -> Self {
        self.use_temp_dir = enabled;
        self
    }

    fn is_blocked(key: &str) -> bool {
        let upper = key.to_uppercase();
        BLOCKED_KEY_SUBSTRINGS
            .iter()
            .any(|substr| upper.contains(substr))
    }
}

impl SandboxProvider for BasicSandbox {
    fn prepare(&self, base_cwd: &std::path::Path, env: &BTreeMap<String, String>) -> SandboxPlan {
        let filtered: BTreeMap<String, String> = env
            .iter()
            .filter(|(key, _)| self.allowlist.contains(key.as_str()) && !Self::is_blocked(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let (cwd, cleanup_dir) = if self.use_temp_dir {
            let dir = std::env::temp_dir().join(format!("antcode-run-{}", uuid::Uuid::new_v4()));
            (dir.clone(), Some(dir))
        } else {
            (base_cwd.to_path_buf(), None)
        };

        SandboxPlan {
            prefix: self.command_prefix.clone(),
            env: filtered,
            cwd,
            cleanup_dir,
        }
    }
}
