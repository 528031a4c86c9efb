// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! antcode-workerd: composition root for the Worker process. Wires the
//! Python plugin (`PipRuntimeBuilder`/`PythonEntryPointPlanBuilder`), the
//! process executor, a no-op sandbox, and a Gateway transport into
//! `WorkerEngine` (spec.md §4.6-§4.9).
//!
//! Only the Gateway transport is wired here: `DirectTransport` shares an
//! in-process `MetadataStore` with the Master loops, which only makes
//! sense when Worker and Master run inside the same process - not a
//! deployment shape this binary targets.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use antcode_core::clock::SystemClock;
use antcode_core::config::Config;

use antcode_worker::{ArtifactFetcher, GatewayTransport, NoOpSandbox, PipRuntimeBuilder, ProcessExecutor, ProjectCache, PythonEntryPointPlanBuilder, RuntimeManager, WorkerEngine};

use antcode_backends::redis_backend::RedisLogStorage;

#[derive(Parser, Debug)]
#[command(name = "antcode-workerd", about = "antcode Worker: fetches, prepares, and executes dispatched tasks")]
struct Args {
    /// Stable identity this process registers heartbeats and polls under.
    #[arg(long, env = "ANTCODE_WORKER_ID")]
    worker_id: String,

    /// Gateway gRPC endpoint, e.g. `http://gateway.internal:7443`.
    #[arg(long, env = "ANTCODE_GATEWAY_ENDPOINT")]
    gateway_endpoint: String,

    /// Redis key namespace, shared with Master and Gateway (spec.md §6).
    #[arg(long, env = "ANTCODE_NAMESPACE", default_value = "antcode")]
    namespace: String,

    /// Directory prepared venvs and cached project artifacts live under.
    #[arg(long, env = "ANTCODE_WORKER_STATE_DIR", default_value = "./antcode-worker-state")]
    state_dir: std::path::PathBuf,

    /// Ceiling on concurrently running tasks (spec.md §4.6/§5).
    #[arg(long, env = "ANTCODE_WORKER_MAX_CONCURRENT_RUNS", default_value_t = 5)]
    max_concurrent_runs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::load()?;
    info!(worker_id = %args.worker_id, gateway_endpoint = %args.gateway_endpoint, "starting antcode-workerd");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis_client.get_connection_manager().await?;

    let clock: Arc<dyn antcode_core::clock::Clock> = Arc::new(SystemClock);
    let logs = Arc::new(RedisLogStorage::new(conn, args.namespace.clone()));

    let transport = Arc::new(GatewayTransport::connect(args.gateway_endpoint).await?);
    let cache = ProjectCache::new(args.state_dir.join("projects"), clock.clone());
    let fetcher = Arc::new(ArtifactFetcher::new(cache));
    let runtime_manager = Arc::new(RuntimeManager::new(args.state_dir.join("venvs"), PipRuntimeBuilder::default(), clock.clone()));
    let sandbox = Arc::new(NoOpSandbox);
    let executor = Arc::new(ProcessExecutor);
    let plan_builder = Arc::new(PythonEntryPointPlanBuilder);

    let engine = Arc::new(
        WorkerEngine::new(
            args.worker_id,
            transport,
            fetcher,
            runtime_manager,
            sandbox,
            executor,
            logs,
            plan_builder,
            clock,
            None,
        )
        .with_max_concurrent_runs(args.max_concurrent_runs),
    );

    engine.run().await
}
