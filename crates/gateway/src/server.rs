// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gRPC server bootstrap: health reporter, reflection service, and the
//! `WorkerGateway` service, served with gzip compression (spec.md §4.5).

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::codec::CompressionEncoding;
use tonic::transport::{Error, Server};

use antcode_backends::log_storage::LogStorageBackend;
use antcode_backends::progress::ProgressStore;
use antcode_backends::queue::QueueBackend;
use antcode_core::clock::Clock;
use antcode_core::metadata_store::MetadataStore;

use antcode_proto::worker::worker_gateway_server::WorkerGatewayServer;
use antcode_proto::FILE_DESCRIPTOR_SET;

use crate::service::WorkerGatewayService;

pub async fn start_grpc_server<S, Q, P, L, C>(
    addr: SocketAddr,
    store: Arc<S>,
    queue: Arc<Q>,
    progress: Arc<P>,
    logs: Arc<L>,
    clock: Arc<C>,
    namespace: impl Into<String>,
) -> Result<(), Error>
where
    S: MetadataStore + 'static,
    Q: QueueBackend + 'static,
    P: ProgressStore + 'static,
    L: LogStorageBackend + 'static,
    C: Clock + 'static,
{
    let service = WorkerGatewayService::new(store, queue, progress, logs, clock, namespace);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<WorkerGatewayServer<WorkerGatewayService<S, Q, P, L, C>>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("embedded file descriptor set is always well-formed");

    Server::builder()
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(
            WorkerGatewayServer::new(service)
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip),
        )
        .serve(addr)
        .await
}
