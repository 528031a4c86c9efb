// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker: a registered execution node.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Stable public identifier for a registered Worker.
    pub struct WorkerId;
}

/// How a Worker reaches the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Speaks Redis Streams directly (trusted network).
    Direct,
    /// Speaks gRPC/TLS to a Gateway that proxies Redis operations.
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
    Maintenance,
}

/// Point-in-time resource metrics reported on heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub running_tasks: u32,
}

/// A registered execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub region: String,
    pub transport: TransportMode,
    /// Issued at registration/admin-creation time; never returned after.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// HMAC key used to verify dispatch-payload signatures (§6). Never
    /// serialized back out over the wire once issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub last_heartbeat_ms: Option<u64>,
    pub metrics: MetricsSnapshot,
    pub os: String,
    pub arch: String,
    /// Per-Worker configured list of ready-stream names to poll; resolves
    /// the Open Question about per-worker vs. global ready streams
    /// (SPEC_FULL.md §9). Defaults to the single per-worker stream.
    #[serde(default)]
    pub streams: Vec<String>,
}

impl Worker {
    /// True when `capabilities` is a superset of everything `required` asks for.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// True when the last heartbeat is within `threshold_secs` of `now_ms`.
    pub fn is_heartbeat_fresh(&self, now_ms: u64, threshold_secs: u64) -> bool {
        match self.last_heartbeat_ms {
            Some(hb) => now_ms.saturating_sub(hb) <= threshold_secs * 1000,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(caps: &[&str]) -> Worker {
        Worker {
            id: WorkerId::new("w-1"),
            name: "w-1".into(),
            host: "10.0.0.1".into(),
            port: 7000,
            region: "us-east".into(),
            transport: TransportMode::Direct,
            api_key: None,
            secret: None,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            status: WorkerStatus::Online,
            last_heartbeat_ms: Some(1_000),
            metrics: MetricsSnapshot::default(),
            os: "linux".into(),
            arch: "x86_64".into(),
            streams: vec![],
        }
    }

    #[test]
    fn satisfies_requires_full_capability_subset() {
        let w = worker(&["rendering", "http"]);
        let required: BTreeSet<String> = ["rendering"].iter().map(|s| s.to_string()).collect();
        assert!(w.satisfies(&required));

        let required: BTreeSet<String> =
            ["rendering", "gpu"].iter().map(|s| s.to_string()).collect();
        assert!(!w.satisfies(&required));
    }

    #[test]
    fn heartbeat_freshness_threshold() {
        let w = worker(&[]);
        assert!(w.is_heartbeat_fresh(1_000, 60));
        assert!(w.is_heartbeat_fresh(61_000, 60));
        assert!(!w.is_heartbeat_fresh(61_001, 60));
    }

    #[test]
    fn missing_heartbeat_is_never_fresh() {
        let mut w = worker(&[]);
        w.last_heartbeat_ms = None;
        assert!(!w.is_heartbeat_fresh(0, 60));
    }
}
