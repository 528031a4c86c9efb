// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker resolution for the scheduler loop (spec.md §4.2).

use std::collections::BTreeSet;

use antcode_core::model::{ExecutionStrategy, TaskRun, Worker, WorkerId, WorkerStatus};

/// Why no target Worker could be found for a Task's execution strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// `Fixed`/`Specified` named a worker that is not currently online.
    BoundWorkerOffline(WorkerId),
    /// `AnyCapable`/`PreferBound` fallback found no online worker whose
    /// declared capabilities satisfy the project type.
    NoCapableWorker,
}

/// Required capability tag for a project type (spec.md §6's `project_type`
/// enum: code | file | rule | render).
pub fn required_capability(project_type: &str) -> BTreeSet<String> {
    [project_type.to_string()].into_iter().collect()
}

/// Count of non-terminal [`TaskRun`]s currently assigned to a worker, used
/// as the least-loaded tie-break.
pub fn running_load(runs: &[TaskRun], worker: &WorkerId) -> usize {
    runs.iter()
        .filter(|r| r.assigned_worker.as_ref() == Some(worker) && !r.is_terminal())
        .count()
}

/// Resolve a target Worker for `strategy`, given the full online/offline
/// Worker population and their current non-terminal run counts.
///
/// `all_runs` is consulted only for load tie-breaking in the `AnyCapable`
/// path; callers typically pass a fresh snapshot from the metadata store.
pub fn resolve_worker(
    strategy: &ExecutionStrategy,
    workers: &[Worker],
    all_runs: &[TaskRun],
    project_type: &str,
) -> Result<WorkerId, ResolutionError> {
    match strategy {
        ExecutionStrategy::Fixed { worker_id } | ExecutionStrategy::Specified { worker_id } => {
            match workers
                .iter()
                .find(|w| &w.id == worker_id && w.status == WorkerStatus::Online)
            {
                Some(w) => Ok(w.id.clone()),
                None => Err(ResolutionError::BoundWorkerOffline(worker_id.clone())),
            }
        }
        ExecutionStrategy::AnyCapable => any_capable(workers, all_runs, project_type),
        ExecutionStrategy::PreferBound { worker_id } => {
            if let Some(w) = workers
                .iter()
                .find(|w| &w.id == worker_id && w.status == WorkerStatus::Online)
            {
                return Ok(w.id.clone());
            }
            any_capable(workers, all_runs, project_type)
        }
    }
}

fn any_capable(
    workers: &[Worker],
    all_runs: &[TaskRun],
    project_type: &str,
) -> Result<WorkerId, ResolutionError> {
    let required = required_capability(project_type);
    workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Online && w.satisfies(&required))
        .min_by_key(|w| running_load(all_runs, &w.id))
        .map(|w| w.id.clone())
        .ok_or(ResolutionError::NoCapableWorker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::model::{MetricsSnapshot, TaskId, TaskRunId, TransportMode};

    fn worker(id: &str, caps: &[&str], status: WorkerStatus) -> Worker {
        Worker {
            id: WorkerId::new(id),
            name: id.into(),
            host: "10.0.0.1".into(),
            port: 7000,
            region: "us-east".into(),
            transport: TransportMode::Direct,
            api_key: None,
            secret: None,
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            status,
            last_heartbeat_ms: Some(0),
            metrics: MetricsSnapshot::default(),
            os: "linux".into(),
            arch: "x86_64".into(),
            streams: vec![],
        }
    }

    #[test]
    fn fixed_strategy_requires_bound_worker_online() {
        let workers = vec![worker("w-1", &["code"], WorkerStatus::Offline)];
        let strategy = ExecutionStrategy::Fixed {
            worker_id: WorkerId::new("w-1"),
        };
        let err = resolve_worker(&strategy, &workers, &[], "code").unwrap_err();
        assert_eq!(err, ResolutionError::BoundWorkerOffline(WorkerId::new("w-1")));
    }

    #[test]
    fn any_capable_picks_least_loaded() {
        let workers = vec![
            worker("w-1", &["code"], WorkerStatus::Online),
            worker("w-2", &["code"], WorkerStatus::Online),
        ];
        let mut busy = TaskRun::new(TaskRunId::new("r-1"), TaskId::new("t-1"), 0);
        busy.assigned_worker = Some(WorkerId::new("w-1"));
        busy.apply_dispatch_transition(antcode_core::model::DispatchStatus::Dispatched, 1);
        busy.apply_runtime_transition(antcode_core::model::RuntimeStatus::Running, 1);

        let picked = resolve_worker(&ExecutionStrategy::AnyCapable, &workers, &[busy], "code").unwrap();
        assert_eq!(picked, WorkerId::new("w-2"));
    }

    #[test]
    fn prefer_bound_falls_back_when_offline() {
        let workers = vec![
            worker("w-1", &["code"], WorkerStatus::Offline),
            worker("w-2", &["code"], WorkerStatus::Online),
        ];
        let strategy = ExecutionStrategy::PreferBound {
            worker_id: WorkerId::new("w-1"),
        };
        let picked = resolve_worker(&strategy, &workers, &[], "code").unwrap();
        assert_eq!(picked, WorkerId::new("w-2"));
    }

    #[test]
    fn any_capable_rejects_workers_missing_capability() {
        let workers = vec![worker("w-1", &["render"], WorkerStatus::Online)];
        let err = resolve_worker(&ExecutionStrategy::AnyCapable, &workers, &[], "code").unwrap_err();
        assert_eq!(err, ResolutionError::NoCapableWorker);
    }
}
