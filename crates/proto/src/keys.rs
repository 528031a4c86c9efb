// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Redis key conventions (spec.md §6). Every key is namespace-scoped so a
//! single Redis instance can host more than one deployment.

pub const DEFAULT_NAMESPACE: &str = "antcode";
pub const CONSUMER_GROUP: &str = "antcode-workers";

pub fn worker_ready_stream(namespace: &str, worker_id: &str) -> String {
    format!("{namespace}:task:ready:{worker_id}")
}

pub fn global_ready_stream(namespace: &str) -> String {
    format!("{namespace}:task:ready")
}

pub fn worker_pending_stream(namespace: &str, worker_id: &str) -> String {
    format!("{namespace}:task:pending:{worker_id}")
}

pub fn result_stream(namespace: &str) -> String {
    format!("{namespace}:task:result")
}

pub fn ack_stream(namespace: &str) -> String {
    format!("{namespace}:task:ack")
}

pub fn worker_control_stream(namespace: &str, worker_id: &str) -> String {
    format!("{namespace}:control:{worker_id}")
}

pub fn global_control_stream(namespace: &str) -> String {
    format!("{namespace}:control:global")
}

pub fn log_stream(namespace: &str, run_id: &str) -> String {
    format!("{namespace}:log:stream:{run_id}")
}

pub fn log_chunk_stream(namespace: &str, run_id: &str) -> String {
    format!("{namespace}:log:chunk:{run_id}")
}

pub fn heartbeat_hash(namespace: &str, worker_id: &str) -> String {
    format!("{namespace}:heartbeat:{worker_id}")
}

pub fn active_worker_set(namespace: &str) -> String {
    format!("{namespace}:heartbeat:active")
}

pub fn runtime_build_lock(namespace: &str, hash: &str) -> String {
    format!("{namespace}:lock:runtime:{hash}")
}

/// Not namespace-scoped: the fencing counter is a single cluster-wide value
/// per spec.md §6's literal key.
pub fn fencing_counter() -> &'static str {
    "fencing:token:master"
}
