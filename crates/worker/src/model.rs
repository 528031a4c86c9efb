// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared value types passed between the Worker engine, runtime manager,
//! plugin registry, and executors (spec.md §4.6–§4.9).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use antcode_core::model::{RuntimeHandle, TaskRunId};

/// Per-task state tracked by the engine's state manager (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Preparing,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled | RunState::Timeout
        )
    }
}

/// An artifact the executor collected after the process exited, matched
/// against the plan's glob patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Built by a plugin from a dispatch payload: everything the executor needs
/// to spawn and bound the child process (spec.md §4.6 item 4).
#[derive(Debug, Clone)]
pub struct ExecPlan {
    pub run_id: TaskRunId,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub grace_period: Duration,
    pub max_output_lines: usize,
    pub max_output_bytes: usize,
    pub artifact_globs: Vec<String>,
}

/// Why a run stopped, independent of its terminal [`RunState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    TimedOut,
    Cancelled,
    Signalled,
}

/// The result of one execution, handed back to the engine for finalization.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub run_id: TaskRunId,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub exit_reason: ExitReason,
    pub error_message: Option<String>,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub artifacts: Vec<ArtifactRef>,
}

/// A runtime-prepared handle plus the deterministic spec hash it came from,
/// bundled for convenience at the call sites that need both.
#[derive(Debug, Clone)]
pub struct PreparedRuntime {
    pub handle: RuntimeHandle,
}
