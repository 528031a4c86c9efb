// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RuntimeSpec and the content-addressed runtime hash.
//!
//! The spec's deterministic subset (python interpreter requirement, lock
//! source, constraints, extras) is hashed with a canonical JSON encoding;
//! non-deterministic fields (env vars, secret references, metadata) never
//! participate, so two specs differing only in environment variables share
//! one on-disk runtime (spec.md §3, §8 invariant 1).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Python interpreter selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonSpec {
    pub version: Option<String>,
    pub path: Option<String>,
}

/// Where the dependency lock comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum LockSource {
    Requirements { requirements: Vec<String> },
    ContentHash { content_hash: String },
    Uri { uri: String },
    Inline { content: String },
}

impl Default for LockSource {
    fn default() -> Self {
        LockSource::Requirements {
            requirements: Vec::new(),
        }
    }
}

/// Scope of a prepared runtime directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeScope {
    Shared,
    Private,
}

/// The full specification of an execution environment a Task asks for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    // Deterministic fields — participate in the hash.
    pub python: PythonSpec,
    pub lock_source: LockSource,
    pub constraints: Vec<String>,
    pub extras: Vec<String>,

    // Non-deterministic fields — excluded from the hash.
    #[serde(default)]
    pub env_vars: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub secret_refs: Vec<String>,
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
}

/// The canonical, hash-stable encoding of a spec's deterministic fields.
#[derive(Serialize)]
struct DeterministicView<'a> {
    python: &'a PythonSpec,
    lock_source: CanonicalLockSource<'a>,
    constraints: Vec<&'a str>,
    extras: Vec<&'a str>,
}

/// `LockSource` with its internal list fields sorted, so hashing is
/// insensitive to caller-supplied ordering.
#[derive(Serialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
enum CanonicalLockSource<'a> {
    Requirements { requirements: Vec<&'a str> },
    ContentHash { content_hash: &'a str },
    Uri { uri: &'a str },
    Inline { content: &'a str },
}

impl RuntimeSpec {
    /// Compute the content-addressed runtime hash over the deterministic
    /// subset of this spec, as a lowercase hex SHA-256 digest.
    pub fn runtime_hash(&self) -> String {
        let mut constraints: Vec<&str> = self.constraints.iter().map(String::as_str).collect();
        constraints.sort_unstable();
        let mut extras: Vec<&str> = self.extras.iter().map(String::as_str).collect();
        extras.sort_unstable();

        let lock_source = match &self.lock_source {
            LockSource::Requirements { requirements } => {
                let mut reqs: Vec<&str> = requirements.iter().map(String::as_str).collect();
                reqs.sort_unstable();
                CanonicalLockSource::Requirements { requirements: reqs }
            }
            LockSource::ContentHash { content_hash } => CanonicalLockSource::ContentHash {
                content_hash,
            },
            LockSource::Uri { uri } => CanonicalLockSource::Uri { uri },
            LockSource::Inline { content } => CanonicalLockSource::Inline { content },
        };

        let view = DeterministicView {
            python: &self.python,
            lock_source,
            constraints,
            extras,
        };
        // Canonical JSON: serde_json's map serialization order for our
        // structs is field-declaration order (no maps with unordered keys
        // appear in `view`), so this is stable across runs and processes.
        let encoded =
            serde_json::to_vec(&view).expect("DeterministicView serializes infallibly");
        let digest = Sha256::digest(&encoded);
        hex::encode(digest)
    }

    /// Return a copy with additional environment variables merged in.
    /// Non-deterministic — does not change `runtime_hash()`.
    pub fn with_env_vars(&self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut spec = self.clone();
        spec.env_vars.extend(vars);
        spec
    }
}

/// A prepared, usable runtime handed back to the Worker engine.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    pub hash: String,
    pub path: PathBuf,
    pub python_executable: PathBuf,
    pub scope: RuntimeScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_env(env_value: &str) -> RuntimeSpec {
        RuntimeSpec {
            python: PythonSpec {
                version: Some("3.11".into()),
                path: None,
            },
            lock_source: LockSource::Requirements {
                requirements: vec!["requests==2.31".into(), "lxml==5.2".into()],
            },
            constraints: vec![],
            extras: vec![],
            env_vars: [("A".to_string(), env_value.to_string())].into(),
            secret_refs: vec![],
            metadata: Default::default(),
        }
    }

    #[test]
    fn hash_is_stable_across_differing_env_vars() {
        let a = spec_with_env("1");
        let b = spec_with_env("2");
        assert_eq!(a.runtime_hash(), b.runtime_hash());
    }

    #[test]
    fn hash_is_insensitive_to_requirement_order() {
        let mut a = spec_with_env("1");
        let mut b = a.clone();
        b.lock_source = LockSource::Requirements {
            requirements: vec!["lxml==5.2".into(), "requests==2.31".into()],
        };
        a.env_vars.clear();
        b.env_vars.clear();
        assert_eq!(a.runtime_hash(), b.runtime_hash());
    }

    #[test]
    fn hash_changes_when_deterministic_field_differs() {
        let a = spec_with_env("1");
        let mut b = a.clone();
        b.python.version = Some("3.12".into());
        assert_ne!(a.runtime_hash(), b.runtime_hash());
    }

    #[test]
    fn hash_changes_when_lock_source_kind_differs() {
        let a = spec_with_env("1");
        let mut b = a.clone();
        b.lock_source = LockSource::ContentHash {
            content_hash: "deadbeef".into(),
        };
        assert_ne!(a.runtime_hash(), b.runtime_hash());
    }
}
