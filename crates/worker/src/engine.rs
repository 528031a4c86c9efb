// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The top-level Worker loop (spec.md §4.6): polls for dispatches, bounds
//! concurrent runs with a semaphore, and drives each run through
//! verify → fetch → prepare runtime → sandbox → execute → report, with
//! cancellation and a dual-channel log sink wired in throughout.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{error, info, warn};

use antcode_backends::log_storage::{LogChannel, LogStorageBackend};
use antcode_core::clock::Clock;
use antcode_core::model::RuntimeSpec;

use antcode_proto::worker::TaskDispatch;

use crate::executor::{Executor, OutputSink};
use crate::fetcher::ArtifactFetcher;
use crate::logs::{BatchConfig, BatchSender, LogArchiver};
use crate::model::{ExecPlan, RunState};
use crate::runtime::{RuntimeBuilder, RuntimeManager};
use crate::sandbox::SandboxProvider;
use crate::signature::{verify_dispatch_signature, DispatchSignature, NonceCache};
use crate::transport::Transport;

/// Default concurrent-run ceiling (spec.md §4.6/§5).
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 5;
const LOG_CHUNK_SIZE: usize = 64 * 1024;
const BATCH_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Turns a dispatch plus the project directory a fetch produced into an
/// `ExecPlan`, and the `RuntimeSpec` the runtime manager should prepare for
/// it. Implemented per `project_type` by whatever owns the plugin registry;
/// out of this crate's scope otherwise.
#[async_trait::async_trait]
pub trait PlanBuilder: Send + Sync {
    fn runtime_spec(&self, dispatch: &TaskDispatch) -> RuntimeSpec;

    async fn build_plan(
        &self,
        dispatch: &TaskDispatch,
        project_dir: &Path,
        python_executable: &Path,
    ) -> Result<ExecPlan, String>;
}

struct DualChannelSink<L> {
    batch: Arc<BatchSender<L>>,
    stdout_archiver: Mutex<LogArchiver<L>>,
    stderr_archiver: Mutex<LogArchiver<L>>,
    clock: Arc<dyn Clock>,
}

#[async_trait::async_trait]
impl<L: LogStorageBackend + 'static> OutputSink for DualChannelSink<L> {
    async fn stdout_line(&self, line: String) {
        let ts_ms = self.clock.epoch_ms();
        self.batch.write(LogChannel::Stdout, line.clone(), ts_ms).await;
        let mut line_bytes = line.into_bytes();
        line_bytes.push(b'\n');
        let _ = self.stdout_archiver.lock().await.append(&line_bytes).await;
    }

    async fn stderr_line(&self, line: String) {
        let ts_ms = self.clock.epoch_ms();
        self.batch.write(LogChannel::Stderr, line.clone(), ts_ms).await;
        let mut line_bytes = line.into_bytes();
        line_bytes.push(b'\n');
        let _ = self.stderr_archiver.lock().await.append(&line_bytes).await;
    }

    async fn system_line(&self, line: String) {
        let ts_ms = self.clock.epoch_ms();
        self.batch.write(LogChannel::System, line, ts_ms).await;
    }
}

/// Ties the engine's collaborators together. Each type parameter is a
/// pluggable collaborator (runtime builder, sandbox, executor, log
/// storage, plan builder), following this workspace's generic-over-trait
/// convention (compare `master::SchedulerLoop<S, Q, P, C>`).
pub struct WorkerEngine<B, X, E, L, PB> {
    worker_id: String,
    transport: Arc<dyn Transport>,
    fetcher: Arc<ArtifactFetcher>,
    runtime_manager: Arc<RuntimeManager<B>>,
    sandbox: Arc<X>,
    executor: Arc<E>,
    logs: Arc<L>,
    plan_builder: Arc<PB>,
    clock: Arc<dyn Clock>,
    dispatch_secret: Option<Vec<u8>>,
    max_concurrent_runs: usize,
    poll_count: u32,
    poll_block_ms: u64,
    cancels: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl<B, X, E, L, PB> WorkerEngine<B, X, E, L, PB>
where
    B: RuntimeBuilder + 'static,
    X: SandboxProvider + 'static,
    E: Executor + 'static,
    L: LogStorageBackend + 'static,
    PB: PlanBuilder + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        fetcher: Arc<ArtifactFetcher>,
        runtime_manager: Arc<RuntimeManager<B>>,
        sandbox: Arc<X>,
        executor: Arc<E>,
        logs: Arc<L>,
        plan_builder: Arc<PB>,
        clock: Arc<dyn Clock>,
        dispatch_secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            transport,
            fetcher,
            runtime_manager,
            sandbox,
            executor,
            logs,
            plan_builder,
            clock,
            dispatch_secret,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            poll_count: DEFAULT_MAX_CONCURRENT_RUNS as u32,
            poll_block_ms: 5_000,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_max_concurrent_runs(mut self, n: usize) -> Self {
        self.max_concurrent_runs = n;
        self.poll_count = n as u32;
        self
    }

    /// Requests cancellation of a run already accepted by this engine.
    /// Returns `false` if no such run is currently tracked.
    pub async fn cancel(&self, run_id: &str) -> bool {
        if let Some(tx) = self.cancels.lock().await.get(run_id) {
            let _ = tx.send(true);
            true
        } else {
            false
        }
    }

    /// Poll-dispatch-execute forever. Never returns under normal operation;
    /// a failed poll is logged and retried after a short backoff.
    pub async fn run(self: Arc<Self>) -> ! {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_runs));
        let mut nonces = NonceCache::new(4096);

        loop {
            let dispatches = match self
                .transport
                .poll_task(&self.worker_id, self.poll_count, self.poll_block_ms)
                .await
            {
                Ok(dispatches) => dispatches,
                Err(e) => {
                    warn!(error = %e, "poll_task failed");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    continue;
                }
            };

            for dispatch in dispatches {
                if let Err(e) = self.verify(&dispatch, &mut nonces) {
                    warn!(run_id = %dispatch.run_id, error = %e, "rejecting dispatch with invalid signature");
                    let _ = self
                        .transport
                        .ack_task(&self.worker_id, &dispatch.receipt, false, &e.to_string())
                        .await;
                    continue;
                }

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => continue,
                };
                let engine = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    engine.run_one(dispatch).await;
                });
            }
        }
    }

    fn verify(&self, dispatch: &TaskDispatch, nonces: &mut NonceCache) -> Result<(), crate::signature::SignatureError> {
        let Some(secret) = self.dispatch_secret.as_deref() else {
            return Ok(());
        };
        let Some(sig) = dispatch.signature.as_ref() else {
            return Ok(());
        };
        let dispatch_sig = DispatchSignature {
            issued_at: sig.issued_at,
            expires_at: sig.expires_at,
            nonce: sig.nonce.clone(),
            signature: sig.signature.clone(),
            algorithm: sig.algorithm.clone(),
        };
        let now_secs = self.clock.epoch_ms() as i64 / 1000;
        verify_dispatch_signature(&dispatch.run_id, &dispatch_sig, secret, nonces, now_secs)
    }

    async fn run_one(&self, dispatch: TaskDispatch) {
        let run_id = dispatch.run_id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.lock().await.insert(run_id.clone(), cancel_tx);

        let result = self.execute_dispatch(&dispatch, cancel_rx).await;

        self.cancels.lock().await.remove(&run_id);

        match result {
            Ok((state, exit_code, error_message, start_ms, end_ms)) => {
                let status = match state {
                    RunState::Completed => "success",
                    RunState::Failed => "failed",
                    RunState::Cancelled => "cancelled",
                    RunState::Timeout => "timeout",
                    _ => "failed",
                };
                if let Err(e) = self
                    .transport
                    .report_result(&run_id, status, exit_code, &error_message, start_ms, end_ms)
                    .await
                {
                    error!(run_id = %run_id, error = %e, "failed to report run result");
                }
                let _ = self.transport.ack_task(&self.worker_id, &dispatch.receipt, true, "").await;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run failed before execution started");
                let _ = self
                    .transport
                    .ack_task(&self.worker_id, &dispatch.receipt, false, &e)
                    .await;
            }
        }
    }

    async fn execute_dispatch(
        &self,
        dispatch: &TaskDispatch,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<(RunState, Option<i32>, String, u64, u64), String> {
        let is_compressed = dispatch.is_compressed;
        let file_hash = (!dispatch.file_hash.is_empty()).then_some(dispatch.file_hash.as_str());

        let project_dir = self
            .fetcher
            .fetch(
                &dispatch.project_id,
                &dispatch.download_url,
                file_hash,
                is_compressed,
                (!dispatch.entry_point.is_empty()).then_some(dispatch.entry_point.as_str()),
            )
            .await
            .map_err(|e| format!("artifact fetch failed: {e}"))?;

        let runtime_spec = self.plan_builder.runtime_spec(dispatch);
        let runtime = self
            .runtime_manager
            .prepare(&runtime_spec)
            .await
            .map_err(|e| format!("runtime preparation failed: {e}"))?;

        let plan = self
            .plan_builder
            .build_plan(dispatch, &project_dir, &runtime.python_executable)
            .await
            .map_err(|e| format!("plan construction failed: {e}"))?;

        let sandbox_plan = self.sandbox.prepare(&plan.cwd, &plan.env);

        let sink = Arc::new(DualChannelSink {
            batch: Arc::new(BatchSender::new(dispatch.run_id.clone(), self.logs.clone(), BatchConfig::default())),
            stdout_archiver: Mutex::new(LogArchiver::new(dispatch.run_id.clone(), LogChannel::Stdout, self.logs.clone(), LOG_CHUNK_SIZE)),
            stderr_archiver: Mutex::new(LogArchiver::new(dispatch.run_id.clone(), LogChannel::Stderr, self.logs.clone(), LOG_CHUNK_SIZE)),
            clock: self.clock.clone(),
        });

        // Flushes the batch sender on a 1s tick while the run is in
        // flight, rather than only after the process exits (spec.md §4.9
        // item 1: batch_timeout).
        let (stop_ticker_tx, mut stop_ticker_rx) = watch::channel(false);
        let ticker_batch = sink.batch.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(BATCH_FLUSH_INTERVAL) => {
                        let _ = ticker_batch.flush().await;
                    }
                    _ = stop_ticker_rx.changed() => break,
                }
            }
        });

        let result = self
            .executor
            .execute(&plan, &sandbox_plan, sink.clone() as Arc<dyn OutputSink>, self.clock.as_ref(), cancel_rx)
            .await;

        let _ = stop_ticker_tx.send(true);
        let _ = ticker.await;

        while sink.batch.queue_len().await > 0 {
            if sink.batch.flush().await.is_err() {
                break;
            }
        }
        // The executor has finished and awaited its own streaming tasks, so
        // `sink` should be the only remaining strong reference.
        match Arc::try_unwrap(sink) {
            Ok(sink) => {
                let _ = sink.stdout_archiver.into_inner().finalize().await;
                let _ = sink.stderr_archiver.into_inner().finalize().await;
            }
            Err(_) => warn!(run_id = %dispatch.run_id, "log sink outlived its run, archivers left unfinalized"),
        }

        self.runtime_manager.release(&runtime).await;

        if let Some(dir) = sandbox_plan.cleanup_dir {
            let _ = std::fs::remove_dir_all(dir);
        }

        info!(
            run_id = %dispatch.run_id,
            state = ?result.state,
            artifacts = result.artifacts.len(),
            "run finished"
        );

        Ok((
            result.state,
            result.exit_code,
            result.error_message.unwrap_or_default(),
            result.start_time_ms,
            result.end_time_ms,
        ))
    }
}
