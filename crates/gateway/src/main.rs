// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! antcode-gatewayd: composition root for the Gateway process. Loads
//! configuration, wires the concrete Redis-backed stores and the
//! in-memory metadata store into `start_grpc_server` (spec.md §4.5).

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use antcode_backends::redis_backend::{RedisLogStorage, RedisProgressStore, RedisQueueBackend};
use antcode_core::clock::SystemClock;
use antcode_core::config::Config;
use antcode_core::metadata_store::InMemoryMetadataStore;

use antcode_gateway::server::start_grpc_server;

#[derive(Parser, Debug)]
#[command(name = "antcode-gatewayd", about = "antcode Gateway: Worker-facing gRPC endpoint")]
struct Args {
    /// Redis key namespace, shared with Master and Worker (spec.md §6).
    #[arg(long, env = "ANTCODE_NAMESPACE", default_value = "antcode")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::load()?;
    let addr: SocketAddr = format!("{}:{}", config.gateway_host, config.gateway_port).parse()?;
    info!(%addr, namespace = %args.namespace, "starting antcode-gatewayd");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis_client.get_connection_manager().await?;

    let store = Arc::new(InMemoryMetadataStore::new());
    let queue = Arc::new(RedisQueueBackend::new(conn.clone(), args.namespace.clone(), 5));
    let progress = Arc::new(RedisProgressStore::new(conn.clone(), args.namespace.clone()));
    let logs = Arc::new(RedisLogStorage::new(conn, args.namespace.clone()));
    let clock = Arc::new(SystemClock);

    start_grpc_server(addr, store, queue, progress, logs, clock, args.namespace).await?;
    Ok(())
}
