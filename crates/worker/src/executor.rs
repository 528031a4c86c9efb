// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process execution (spec.md §4.6 item 4, §4.8): spawns the planned
//! command, streams stdout/stderr line-by-line to a log sink, enforces the
//! plan's timeout via SIGTERM then, after a grace period, SIGKILL, and
//! collects artifacts matching the plan's glob patterns.
//!
//! Grounded on the teacher's `run_with_timeout` (`adapters::subprocess`),
//! extended here for line streaming and signal-based cancellation, which
//! that helper's buffered `Command::output()` does not need.

use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::model::{ArtifactRef, ExecPlan, ExecResult, ExitReason, RunState};
use crate::sandbox::SandboxPlan;

/// Sink for one streamed output line; implemented by the batched log
/// sender so the executor stays decoupled from transport concerns.
#[async_trait::async_trait]
pub trait OutputSink: Send + Sync {
    async fn stdout_line(&self, line: String);
    async fn stderr_line(&self, line: String);
    async fn system_line(&self, line: String);
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// `cancel` flips to `true` when the control plane requests
    /// cancellation mid-run (spec.md §4.6 item 5); the executor then sends
    /// SIGTERM, waits `plan.grace_period`, and escalates to SIGKILL.
    async fn execute(
        &self,
        plan: &ExecPlan,
        sandbox: &SandboxPlan,
        sink: Arc<dyn OutputSink>,
        clock: &dyn antcode_core::clock::Clock,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) -> ExecResult;
}

/// Executes `ExecPlan`s as real OS processes.
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn build_command(plan: &ExecPlan, sandbox: &SandboxPlan) -> Command {
        let mut argv: Vec<String> = sandbox.prefix.clone();
        argv.push(plan.program.clone());
        argv.extend(plan.args.clone());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&sandbox.cwd)
            .envs(&sandbox.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Send SIGTERM, wait up to `grace`, then SIGKILL if the child is
    /// still alive (spec.md §4.6 item 5, cancellation path).
    async fn terminate(pid: u32, grace: std::time::Duration) {
        let nix_pid = Pid::from_raw(pid as i32);
        let _ = kill(nix_pid, Signal::SIGTERM);
        tokio::time::sleep(grace).await;
        let _ = kill(nix_pid, Signal::SIGKILL);
    }
}

#[async_trait::async_trait]
impl Executor for ProcessExecutor {
    async fn execute(
        &self,
        plan: &ExecPlan,
        sandbox: &SandboxPlan,
        sink: Arc<dyn OutputSink>,
        clock: &dyn antcode_core::clock::Clock,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) -> ExecResult {
        let start_time_ms = clock.epoch_ms();
        let mut cmd = Self::build_command(plan, sandbox);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecResult {
                    run_id: plan.run_id.clone(),
                    state: RunState::Failed,
                    exit_code: None,
                    exit_reason: ExitReason::Normal,
                    error_message: Some(format!("failed to spawn {}: {err}", plan.program)),
                    start_time_ms,
                    end_time_ms: clock.epoch_ms(),
                    artifacts: Vec::new(),
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = child.id();

        let stdout_task = stdout.map(|out| {
            let sink = sink.clone();
            let max_lines = plan_limits(plan.max_output_lines);
            tokio::spawn(async move {
                stream_lines(out, max_lines, |line| {
                    let sink = sink.clone();
                    async move { sink.stdout_line(line).await }
                })
                .await;
            })
        });
        let stderr_task = stderr.map(|err| {
            let sink = sink.clone();
            let max_lines = plan_limits(plan.max_output_lines);
            tokio::spawn(async move {
                stream_lines(err, max_lines, |line| {
                    let sink = sink.clone();
                    async move { sink.stderr_line(line).await }
                })
                .await;
            })
        });

        // Resolves once `cancel` flips to `true`; if the sender is dropped
        // first we await forever, deferring entirely to the timeout arm.
        let cancelled_watch = async {
            while !*cancel.borrow() {
                if cancel.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        let (exit_code, exit_reason, error_message) = tokio::select! {
            result = tokio::time::timeout(plan.timeout, child.wait()) => match result {
                Ok(Ok(status)) => (status.code(), ExitReason::Normal, None),
                Ok(Err(err)) => (None, ExitReason::Signalled, Some(err.to_string())),
                Err(_) => {
                    if let Some(pid) = pid {
                        Self::terminate(pid, plan.grace_period).await;
                    }
                    let _ = child.wait().await;
                    (
                        None,
                        ExitReason::TimedOut,
                        Some(format!("run exceeded timeout of {:?}", plan.timeout)),
                    )
                }
            },
            _ = cancelled_watch => {
                if let Some(pid) = pid {
                    Self::terminate(pid, plan.grace_period).await;
                }
                let _ = child.wait().await;
                (None, ExitReason::Cancelled, Some("run was cancelled".to_string()))
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let end_time_ms = clock.epoch_ms();
        let state = match exit_reason {
            ExitReason::TimedOut => RunState::Timeout,
            ExitReason::Cancelled => RunState::Cancelled,
            _ if exit_code == Some(0) => RunState::Completed,
            _ => RunState::Failed,
        };

        let artifacts = collect_artifacts(&sandbox.cwd, &plan.artifact_globs);
        sink.system_line(format!("run finished with state {state:?}")).await;

        ExecResult {
            run_id: plan.run_id.clone(),
            state,
            exit_code,
            exit_reason,
            error_message,
            start_time_ms,
            end_time_ms,
            artifacts,
        }
    }
}

fn plan_limits(max_lines: usize) -> usize {
    if max_lines == 0 {
        usize::MAX
    } else {
        max_lines
    }
}

async fn stream_lines<R, F, Fut>(reader: R, max_lines: usize, mut on_line: F)
where
    R: tokio::io::AsyncRead + Unpin,
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut lines = BufReader::new(reader).lines();
    let mut emitted = 0usize;
    while let Ok(Some(line)) = lines.next_line().await {
        if emitted >= max_lines {
            continue;
        }
        on_line(line).await;
        emitted += 1;
    }
}

fn collect_artifacts(base: &std::path::Path, patterns: &[String]) -> Vec<ArtifactRef> {
    let mut artifacts = Vec::new();
    for pattern in patterns {
        let full_pattern = base.join(pattern);
        let Some(pattern_str) = full_pattern.to_str() else {
            continue;
        };
        let Ok(paths) = glob::glob(pattern_str) else {
            continue;
        };
        for entry in paths.flatten() {
            if let Ok(meta) = std::fs::metadata(&entry) {
                if meta.is_file() {
                    artifacts.push(ArtifactRef {
                        path: entry,
                        size_bytes: meta.len(),
                    });
                }
            }
        }
    }
    artifacts
}
