// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `WorkerGateway` tonic service: translates each RPC into the
//! corresponding Redis/metadata-store operation (spec.md §4.5). The
//! Gateway owns no scheduling logic of its own.

use std::sync::Arc;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tonic::{Request, Response, Status};

use antcode_backends::log_storage::{LogChannel, LogChunk, LogStorageBackend};
use antcode_backends::progress::ProgressStore;
use antcode_backends::queue::QueueBackend;
use antcode_core::clock::Clock;
use antcode_core::id::IdGen;
use antcode_core::metadata_store::MetadataStore;
use antcode_core::model::{InstallKey, MetricsSnapshot, TransportMode, Worker, WorkerId, WorkerStatus};

use antcode_proto::worker::worker_gateway_server::WorkerGateway;
use antcode_proto::worker::{
    AckTaskRequest, AckTaskResponse, HealthRequest, HealthResponse, HeartbeatRequest, HeartbeatResponse,
    LogChunkRequest, LogChunkResponse, PollTaskRequest, PollTaskResponse, RegisterRequest, RegisterResponse,
    ReportResultRequest, ReportResultResponse, TaskDispatch, TaskSignature,
};

use crate::auth::{authenticate, PeerCertInfo};
use crate::credentials::MetadataWorkerCredentials;

const SIGNATURE_VALIDITY_SECS: i64 = 300;

fn sign_dispatch(run_id: &str, issued_at: i64, expires_at: i64, nonce: &str, secret: &[u8]) -> String {
    let message = format!("{run_id}:{issued_at}:{expires_at}:{nonce}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Parses a queue-level payload (`QueuedTaskPayload` JSON) plus its
/// priority into a wire `TaskDispatch`, signing it if the worker has a
/// registered secret.
fn to_task_dispatch(
    payload: serde_json::Value,
    priority: i32,
    receipt: String,
    worker_secret: Option<&[u8]>,
    now_ms: u64,
) -> Result<TaskDispatch, serde_json::Error> {
    let parsed: antcode_core::model::QueuedTaskPayload = serde_json::from_value(payload)?;

    let signature = worker_secret.map(|secret| {
        let issued_at = now_ms as i64 / 1000;
        let expires_at = issued_at + SIGNATURE_VALIDITY_SECS;
        let nonce = uuid::Uuid::new_v4().to_string();
        let sig = sign_dispatch(parsed.run_id.as_str(), issued_at, expires_at, &nonce, secret);
        TaskSignature {
            issued_at,
            expires_at,
            nonce,
            signature: sig,
            algorithm: "HMAC-SHA256".into(),
        }
    });

    Ok(TaskDispatch {
        run_id: parsed.run_id.as_str().to_string(),
        task_id: String::new(),
        project_id: parsed.project_id,
        project_type: parsed.project_type,
        priority,
        timeout_secs: parsed.timeout_secs,
        download_url: parsed.download_url,
        file_hash: parsed.expected_file_hash,
        is_compressed: None,
        entry_point: parsed.entry_point,
        params_json: "{}".into(),
        environment_json: serde_json::to_string(&parsed.env_vars).unwrap_or_else(|_| "{}".into()),
        signature,
        receipt,
    })
}

pub struct WorkerGatewayService<S, Q, P, L, C> {
    store: Arc<S>,
    queue: Arc<Q>,
    progress: Arc<P>,
    logs: Arc<L>,
    clock: Arc<C>,
    ids: antcode_core::id::UuidIdGen,
    namespace: String,
    heartbeat_ttl_secs: u64,
}

impl<S, Q, P, L, C> WorkerGatewayService<S, Q, P, L, C>
where
    S: MetadataStore + 'static,
    Q: QueueBackend + 'static,
    P: ProgressStore + 'static,
    L: LogStorageBackend + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, progress: Arc<P>, logs: Arc<L>, clock: Arc<C>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            progress,
            logs,
            clock,
            ids: antcode_core::id::UuidIdGen,
            namespace: namespace.into(),
            heartbeat_ttl_secs: 30,
        }
    }

    /// Every RPC but `Health`/`Register` runs the auth chain first and
    /// returns the authenticated Worker ID on success.
    fn require_auth(&self, request: &Request<impl Send>) -> Result<WorkerId, Status> {
        let creds = MetadataWorkerCredentials::new(Arc::clone(&self.store));
        let peer_cert: Option<PeerCertInfo> = None;
        let ctx = authenticate(request.metadata(), peer_cert.as_ref(), &creds)?;
        Ok(ctx.worker_id)
    }
}

#[async_trait::async_trait]
impl<S, Q, P, L, C> WorkerGateway for WorkerGatewayService<S, Q, P, L, C>
where
    S: MetadataStore + 'static,
    Q: QueueBackend + 'static,
    P: ProgressStore + 'static,
    L: LogStorageBackend + 'static,
    C: Clock + 'static,
{
    async fn health(&self, _request: Request<HealthRequest>) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            healthy: true,
            detail: String::new(),
        }))
    }

    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let now_ms = self.clock.epoch_ms();

        let key = self
            .store
            .find_install_key_by_value(&req.install_key)
            .map_err(|e| Status::internal(e.to_string()))?
            .ok_or_else(|| Status::unauthenticated("unknown install key"))?;

        if !key.is_redeemable(now_ms) {
            return Err(Status::unauthenticated("install key expired or already consumed"));
        }
        if key.os_target != req.os_target {
            return Err(Status::permission_denied("install key is not valid for this OS target"));
        }

        let worker_id = WorkerId::new(self.ids.next());
        let api_key = self.ids.next();
        let secret = self.ids.next();

        let worker = Worker {
            id: worker_id.clone(),
            name: req.hostname,
            host: String::new(),
            port: 0,
            region: String::new(),
            transport: TransportMode::Gateway,
            api_key: Some(api_key.clone()),
            secret: Some(secret.clone()),
            capabilities: Default::default(),
            status: WorkerStatus::Online,
            last_heartbeat_ms: Some(now_ms),
            metrics: MetricsSnapshot::default(),
            os: req.os_target,
            arch: req.arch,
            streams: vec![],
        };
        self.store.put_worker(worker).map_err(|e| Status::internal(e.to_string()))?;

        let consumed_key = InstallKey {
            consumed: true,
            ..key
        };
        self.store
            .put_install_key(consumed_key)
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(RegisterResponse {
            worker_id: worker_id.as_str().to_string(),
            api_key,
            secret,
        }))
    }

    async fn poll_task(&self, request: Request<PollTaskRequest>) -> Result<Response<PollTaskResponse>, Status> {
        self.require_auth(&request)?;
        let req = request.into_inner();

        let worker = self
            .store
            .get_worker(&WorkerId::new(req.worker_id.as_str()))
            .map_err(|e| Status::not_found(e.to_string()))?;
        let worker_secret = worker.secret.as_ref().map(|s| s.as_bytes());
        let now_ms = self.clock.epoch_ms();

        let items = self
            .queue
            .dequeue(&req.worker_id, &req.worker_id, req.count, req.block_ms)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        let mut tasks = Vec::with_capacity(items.len());
        for item in items {
            let receipt = format!("{}|{}", req.worker_id, item.msg_id);
            match to_task_dispatch(item.payload, 0, receipt, worker_secret, now_ms) {
                Ok(dispatch) => tasks.push(dispatch),
                Err(e) => tracing::warn!(error = %e, "dropping malformed queued task payload"),
            }
        }

        Ok(Response::new(PollTaskResponse { tasks }))
    }

    async fn ack_task(&self, request: Request<AckTaskRequest>) -> Result<Response<AckTaskResponse>, Status> {
        self.require_auth(&request)?;
        let req = request.into_inner();

        let (project_id, msg_id) = req
            .receipt
            .split_once('|')
            .ok_or_else(|| Status::invalid_argument("malformed receipt"))?;

        if req.accepted {
            self.queue
                .ack(project_id, &[msg_id.to_string()])
                .await
                .map_err(|e| Status::unavailable(e.to_string()))?;
        } else {
            self.queue
                .move_to_dead_letter(project_id, &[msg_id.to_string()])
                .await
                .map_err(|e| Status::unavailable(e.to_string()))?;
        }

        Ok(Response::new(AckTaskResponse {}))
    }

    async fn report_result(&self, request: Request<ReportResultRequest>) -> Result<Response<ReportResultResponse>, Status> {
        self.require_auth(&request)?;
        let req = request.into_inner();

        let mut run = self
            .store
            .get_task_run(&antcode_core::model::TaskRunId::new(req.run_id.as_str()))
            .map_err(|e| Status::not_found(e.to_string()))?;

        use antcode_core::model::RuntimeStatus;
        let status = match req.status.as_str() {
            "success" => RuntimeStatus::Success,
            "failed" => RuntimeStatus::Failed,
            "cancelled" => RuntimeStatus::Cancelled,
            "timeout" => RuntimeStatus::Timeout,
            "skipped" => RuntimeStatus::Skipped,
            other => return Err(Status::invalid_argument(format!("unknown run status: {other}"))),
        };

        run.start_time_ms = Some(req.start_time_ms);
        run.exit_code = req.exit_code;
        if !req.error_message.is_empty() {
            run.error_message = Some(req.error_message);
        }
        run.apply_runtime_transition(status, req.end_time_ms);

        self.store.put_task_run(run).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(ReportResultResponse {}))
    }

    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<HeartbeatResponse>, Status> {
        self.require_auth(&request)?;
        let req = request.into_inner();
        let now_ms = self.clock.epoch_ms();

        let mut worker = self
            .store
            .get_worker(&WorkerId::new(req.worker_id.as_str()))
            .map_err(|e| Status::not_found(e.to_string()))?;

        worker.last_heartbeat_ms = Some(now_ms);
        worker.status = WorkerStatus::Online;
        worker.metrics = MetricsSnapshot {
            cpu_percent: req.cpu_percent,
            memory_percent: req.memory_percent,
            running_tasks: req.running_tasks,
        };
        self.store.put_worker(worker).map_err(|e| Status::internal(e.to_string()))?;

        self.progress
            .register_active_worker(&self.namespace, &req.worker_id, self.heartbeat_ttl_secs)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(Response::new(HeartbeatResponse { acknowledged: true }))
    }

    async fn stream_logs(
        &self,
        request: Request<tonic::Streaming<LogChunkRequest>>,
    ) -> Result<Response<LogChunkResponse>, Status> {
        self.require_auth(&request)?;
        let mut stream = request.into_inner();
        let mut next_offset = 0u64;

        while let Some(chunk) = stream.message().await? {
            let channel = match chunk.channel.as_str() {
                "stdout" => LogChannel::Stdout,
                "stderr" => LogChannel::Stderr,
                _ => LogChannel::System,
            };

            next_offset = self
                .logs
                .write_chunk(LogChunk {
                    run_id: chunk.run_id.clone(),
                    channel,
                    offset: chunk.offset,
                    data: chunk.data,
                    running_sha256: chunk.running_sha256.clone(),
                })
                .await
                .map_err(|e| Status::unavailable(e.to_string()))?;

            if chunk.is_final {
                self.logs
                    .finalize_chunks(&chunk.run_id, channel, chunk.offset, &chunk.running_sha256)
                    .await
                    .map_err(|e| Status::unavailable(e.to_string()))?;
            }
        }

        Ok(Response::new(LogChunkResponse { next_offset }))
    }
}
