// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker identity file: a YAML document co-located with the Worker process
//! that survives restarts. `worker_id` is immutable once assigned; every
//! other field may change on SIGHUP reload.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::WorkerId;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse identity file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("reload at {path} changed worker_id from {old} to {new}, which is immutable")]
    WorkerIdChanged {
        path: PathBuf,
        old: String,
        new: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, String>,
    pub zone: String,
    pub hostname: String,
    pub ip: String,
    pub version: String,
    pub created_at: String,
}

/// Holds the current identity and the file path it was loaded from,
/// supporting a SIGHUP-triggered reload that enforces `worker_id` stability.
pub struct IdentityFile {
    path: PathBuf,
    current: Identity,
}

impl IdentityFile {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let current = read_identity(&path)?;
        Ok(Self { path, current })
    }

    pub fn current(&self) -> &Identity {
        &self.current
    }

    /// Re-read the identity file, refusing a reload that would change
    /// `worker_id`.
    pub fn reload(&mut self) -> Result<(), IdentityError> {
        let next = read_identity(&self.path)?;
        if next.worker_id != self.current.worker_id {
            return Err(IdentityError::WorkerIdChanged {
                path: self.path.clone(),
                old: self.current.worker_id.as_str().to_string(),
                new: next.worker_id.as_str().to_string(),
            });
        }
        self.current = next;
        Ok(())
    }
}

fn read_identity(path: &Path) -> Result<Identity, IdentityError> {
    let content = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| IdentityError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_identity(dir: &Path, worker_id: &str, zone: &str) -> PathBuf {
        let path = dir.join("identity.yaml");
        std::fs::write(
            &path,
            format!(
                "worker_id: {worker_id}\nzone: {zone}\nhostname: h1\nip: 10.0.0.1\nversion: \"1.0\"\ncreated_at: \"2026-01-01T00:00:00Z\"\n"
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn reload_picks_up_changed_zone() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_identity(dir.path(), "w-1", "us-east");
        let mut identity = IdentityFile::load(&path).unwrap();
        assert_eq!(identity.current().zone, "us-east");

        write_identity(dir.path(), "w-1", "us-west");
        identity.reload().unwrap();
        assert_eq!(identity.current().zone, "us-west");
    }

    #[test]
    fn reload_rejects_changed_worker_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_identity(dir.path(), "w-1", "us-east");
        let mut identity = IdentityFile::load(&path).unwrap();

        write_identity(dir.path(), "w-2", "us-east");
        let err = identity.reload().unwrap_err();
        assert!(matches!(err, IdentityError::WorkerIdChanged { .. }));
        // Original identity is retained on a rejected reload.
        assert_eq!(identity.current().worker_id.as_str(), "w-1");
    }
}
