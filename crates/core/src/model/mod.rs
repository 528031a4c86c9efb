// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The control-plane data model: Task, TaskRun, Worker, Runtime, QueuedTask,
//! InstallKey, and the public identifiers that thread them together.

mod install_key;
mod queued_task;
mod runtime_spec;
mod task;
mod task_run;
mod worker;

pub use install_key::{InstallKey, InstallKeyId};
pub use queued_task::{PriorityBand, QueuedTask, QueuedTaskPayload};
pub use runtime_spec::{LockSource, PythonSpec, RuntimeHandle, RuntimeScope, RuntimeSpec};
pub use task::{BackoffFamily, ExecutionStrategy, RetryPolicy, ScheduleKind, Task, TaskId};
pub use task_run::{DispatchStatus, OverallStatus, RuntimeStatus, TaskRun, TaskRunId};
pub use worker::{TransportMode, Worker, WorkerId, WorkerStatus};
