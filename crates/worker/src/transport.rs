// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport abstraction (spec.md §2): "Worker chooses Direct ... or
//! Gateway ... at boot; both modes present identical semantics."
//! `GatewayTransport` wraps the generated gRPC client; `DirectTransport`
//! drives the same backends the Gateway's own `WorkerGatewayService`
//! drives, in-process, mirroring `gateway::service::WorkerGatewayService`.

use std::sync::Arc;

use thiserror::Error;
use tonic::transport::Channel;

use antcode_backends::log_storage::LogStorageBackend;
use antcode_backends::progress::ProgressStore;
use antcode_backends::queue::QueueBackend;
use antcode_core::clock::Clock;
use antcode_core::metadata_store::MetadataStore;
use antcode_core::model::{MetricsSnapshot, RuntimeStatus, TaskRunId, WorkerId, WorkerStatus};

use antcode_proto::worker::worker_gateway_client::WorkerGatewayClient;
use antcode_proto::worker::{
    AckTaskRequest, HeartbeatRequest, PollTaskRequest, ReportResultRequest, TaskDispatch,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport rpc failed: {0}")]
    Rpc(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::Rpc(status.message().to_string())
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn poll_task(
        &self,
        worker_id: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<TaskDispatch>, TransportError>;

    async fn ack_task(
        &self,
        worker_id: &str,
        receipt: &str,
        accepted: bool,
        reason: &str,
    ) -> Result<(), TransportError>;

    async fn report_result(
        &self,
        run_id: &str,
        status: &str,
        exit_code: Option<i32>,
        error_message: &str,
        start_time_ms: u64,
        end_time_ms: u64,
    ) -> Result<(), TransportError>;

    async fn heartbeat(
        &self,
        worker_id: &str,
        cpu_percent: f32,
        memory_percent: f32,
        running_tasks: u32,
    ) -> Result<(), TransportError>;
}

/// RPC transport: the Worker talks to a remote Gateway over gRPC.
pub struct GatewayTransport {
    client: tokio::sync::Mutex<WorkerGatewayClient<Channel>>,
}

impl GatewayTransport {
    pub fn new(client: WorkerGatewayClient<Channel>) -> Self {
        Self {
            client: tokio::sync::Mutex::new(client),
        }
    }

    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let client = WorkerGatewayClient::connect(endpoint.into())
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait::async_trait]
impl Transport for GatewayTransport {
    async fn poll_task(
        &self,
        worker_id: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<TaskDispatch>, TransportError> {
        let mut client = self.client.lock().await;
        let resp = client
            .poll_task(PollTaskRequest {
                worker_id: worker_id.to_string(),
                count,
                block_ms,
            })
            .await?;
        Ok(resp.into_inner().tasks)
    }

    async fn ack_task(
        &self,
        worker_id: &str,
        receipt: &str,
        accepted: bool,
        reason: &str,
    ) -> Result<(), TransportError> {
        let mut client = self.client.lock().await;
        client
            .ack_task(AckTaskRequest {
                worker_id: worker_id.to_string(),
                receipt: receipt.to_string(),
                accepted,
                reason: reason.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn report_result(
        &self,
        run_id: &str,
        status: &str,
        exit_code: Option<i32>,
        error_message: &str,
        start_time_ms: u64,
        end_time_ms: u64,
    ) -> Result<(), TransportError> {
        let mut client = self.client.lock().await;
        client
            .report_result(ReportResultRequest {
                run_id: run_id.to_string(),
                status: status.to_string(),
                exit_code,
                error_message: error_message.to_string(),
                start_time_ms,
                end_time_ms,
            })
            .await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        cpu_percent: f32,
        memory_percent: f32,
        running_tasks: u32,
    ) -> Result<(), TransportError> {
        let mut client = self.client.lock().await;
        client
            .heartbeat(HeartbeatRequest {
                worker_id: worker_id.to_string(),
                cpu_percent,
                memory_percent,
                running_tasks,
            })
            .await?;
        Ok(())
    }
}

/// In-process transport: drives the same backends the Gateway's RPCs drive,
/// without a network hop, for Workers co-located with their control plane.
pub struct DirectTransport<S, Q, P, C> {
    store: Arc<S>,
    queue: Arc<Q>,
    progress: Arc<P>,
    clock: Arc<C>,
    namespace: String,
    heartbeat_ttl_secs: u64,
}

impl<S, Q, P, C> DirectTransport<S, Q, P, C>
where
    S: MetadataStore + 'static,
    Q: QueueBackend + 'static,
    P: ProgressStore + 'static,
    C: Clock + 'static,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, progress: Arc<P>, clock: Arc<C>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            progress,
            clock,
            namespace: namespace.into(),
            heartbeat_ttl_secs: 30,
        }
    }
}

#[async_trait::async_trait]
impl<S, Q, P, C> Transport for DirectTransport<S, Q, P, C>
where
    S: MetadataStore + 'static,
    Q: QueueBackend + 'static,
    P: ProgressStore + 'static,
    C: Clock + 'static,
{
    async fn poll_task(
        &self,
        worker_id: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<TaskDispatch>, TransportError> {
        let items = self
            .queue
            .dequeue(worker_id, worker_id, count, block_ms)
            .await
            .map_err(|e| TransportError::Store(e.to_string()))?;

        let worker = self
            .store
            .get_worker(&WorkerId::new(worker_id))
            .map_err(|e| TransportError::Store(e.to_string()))?;
        let worker_secret = worker.secret.clone();
        let now_ms = self.clock.epoch_ms();

        let mut tasks = Vec::with_capacity(items.len());
        for item in items {
            let receipt = format!("{worker_id}|{}", item.msg_id);
            match parse_dispatch(item.payload, receipt, worker_secret.as_deref(), now_ms) {
                Ok(dispatch) => tasks.push(dispatch),
                Err(e) => tracing::warn!(error = %e, "dropping malformed queued task payload"),
            }
        }
        Ok(tasks)
    }

    async fn ack_task(
        &self,
        _worker_id: &str,
        receipt: &str,
        accepted: bool,
        _reason: &str,
    ) -> Result<(), TransportError> {
        let (project_id, msg_id) = receipt
            .split_once('|')
            .ok_or_else(|| TransportError::Store("malformed receipt".into()))?;

        if accepted {
            self.queue
                .ack(project_id, &[msg_id.to_string()])
                .await
                .map_err(|e| TransportError::Store(e.to_string()))?;
        } else {
            self.queue
                .move_to_dead_letter(project_id, &[msg_id.to_string()])
                .await
                .map_err(|e| TransportError::Store(e.to_string()))?;
        }
        Ok(())
    }

    async fn report_result(
        &self,
        run_id: &str,
        status: &str,
        exit_code: Option<i32>,
        error_message: &str,
        start_time_ms: u64,
        end_time_ms: u64,
    ) -> Result<(), TransportError> {
        let mut run = self
            .store
            .get_task_run(&TaskRunId::new(run_id))
            .map_err(|e| TransportError::Store(e.to_string()))?;

        let status = match status {
            "success" => RuntimeStatus::Success,
            "failed" => RuntimeStatus::Failed,
            "cancelled" => RuntimeStatus::Cancelled,
            "timeout" => RuntimeStatus::Timeout,
            "skipped" => RuntimeStatus::Skipped,
            other => return Err(TransportError::Store(format!("unknown run status: {other}"))),
        };

        run.start_time_ms = Some(start_time_ms);
        run.exit_code = exit_code;
        if !error_message.is_empty() {
            run.error_message = Some(error_message.to_string());
        }
        run.apply_runtime_transition(status, end_time_ms);

        self.store.put_task_run(run).map_err(|e| TransportError::Store(e.to_string()))
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        cpu_percent: f32,
        memory_percent: f32,
        running_tasks: u32,
    ) -> Result<(), TransportError> {
        let now_ms = self.clock.epoch_ms();
        let mut worker = self
            .store
            .get_worker(&WorkerId::new(worker_id))
            .map_err(|e| TransportError::Store(e.to_string()))?;

        worker.last_heartbeat_ms = Some(now_ms);
        worker.status = WorkerStatus::Online;
        worker.metrics = MetricsSnapshot {
            cpu_percent,
            memory_percent,
            running_tasks,
        };
        self.store.put_worker(worker).map_err(|e| TransportError::Store(e.to_string()))?;

        self.progress
            .register_active_worker(&self.namespace, worker_id, self.heartbeat_ttl_secs)
            .await
            .map_err(|e| TransportError::Store(e.to_string()))
    }
}

fn parse_dispatch(
    payload: serde_json::Value,
    receipt: String,
    worker_secret: Option<&str>,
    now_ms: u64,
) -> Result<TaskDispatch, serde_json::Error> {
    let parsed: antcode_core::model::QueuedTaskPayload = serde_json::from_value(payload)?;

    let signature = worker_secret.map(|secret| {
        let issued_at = now_ms as i64 / 1000;
        let expires_at = issued_at + 300;
        let nonce = uuid::Uuid::new_v4().to_string();
        let sig = sign_dispatch(parsed.run_id.as_str(), issued_at, expires_at, &nonce, secret.as_bytes());
        antcode_proto::worker::TaskSignature {
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
        priority: 0,
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

fn sign_dispatch(run_id: &str, issued_at: i64, expires_at: i64, nonce: &str, secret: &[u8]) -> String {
    use base64::Engine;
    use hmac::Mac;
    let message = format!("{run_id}:{issued_at}:{expires_at}:{nonce}");
    #[allow(clippy::expect_used)]
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_backends::memory::{InMemoryProgressStore, InMemoryQueueBackend};
    use antcode_core::clock::FakeClock;
    use antcode_core::metadata_store::InMemoryMetadataStore;
    use antcode_core::model::{TransportMode, Worker, WorkerStatus};

    fn build_transport() -> DirectTransport<InMemoryMetadataStore, InMemoryQueueBackend, InMemoryProgressStore, FakeClock> {
        let store = Arc::new(InMemoryMetadataStore::new());
        store
            .put_worker(Worker {
                id: WorkerId::new("w-1"),
                name: "host-a".into(),
                host: String::new(),
                port: 0,
                region: String::new(),
                transport: TransportMode::Direct,
                api_key: None,
                secret: Some("shh".into()),
                capabilities: Default::default(),
                status: WorkerStatus::Online,
                last_heartbeat_ms: None,
                metrics: MetricsSnapshot::default(),
                os: "linux".into(),
                arch: "x86_64".into(),
                streams: vec![],
            })
            .unwrap();

        DirectTransport::new(
            store,
            Arc::new(InMemoryQueueBackend::new(5)),
            Arc::new(InMemoryProgressStore::default()),
            Arc::new(FakeClock::new(1_000)),
            "antcode",
        )
    }

    #[tokio::test]
    async fn heartbeat_updates_worker_status_and_registers_active() {
        let transport = build_transport();
        transport.heartbeat("w-1", 10.0, 20.0, 2).await.unwrap();

        let worker = transport.store.get_worker(&WorkerId::new("w-1")).unwrap();
        assert_eq!(worker.metrics.running_tasks, 2);
        assert!(worker.last_heartbeat_ms.is_some());
    }

    #[tokio::test]
    async fn poll_task_returns_empty_when_queue_is_empty() {
        let transport = build_transport();
        let tasks = transport.poll_task("w-1", 5, 0).await.unwrap();
        assert!(tasks.is_empty());
    }
}
