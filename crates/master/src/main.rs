// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! antcode-masterd: composition root for the Master process. Loads
//! configuration, wires concrete Redis backends and the in-memory
//! metadata store to `election`/`scheduler`/`reconcile`/`retry`, and runs
//! all four loops behind a single leader lock (spec.md §4.1-§4.4).

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use antcode_backends::redis_backend::RedisQueueBackend;
use antcode_core::clock::SystemClock;
use antcode_core::config::Config;
use antcode_core::metadata_store::InMemoryMetadataStore;

use antcode_master::{HttpProjectSource, LeaderElector, LoggingAlertSink, ReconcileLoop, RetryLoop, SchedulerLoop};

/// Leader lock TTL (spec.md §4.1).
const LOCK_TTL: Duration = Duration::from_secs(15);
const SCHEDULER_TICK: Duration = Duration::from_secs(2);
const RECONCILE_TICK: Duration = Duration::from_secs(5);
const RETRY_TICK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "antcode-masterd", about = "antcode Master: election, scheduling, reconciliation, retry")]
struct Args {
    /// Redis key namespace, shared with Gateway and Worker (spec.md §6).
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
    info!(namespace = %args.namespace, redis_url = %config.redis_url, "starting antcode-masterd");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis_client.get_connection_manager().await?;

    let store = Arc::new(InMemoryMetadataStore::new());
    let queue = Arc::new(RedisQueueBackend::new(conn.clone(), args.namespace.clone(), 5));
    let projects = Arc::new(HttpProjectSource::new(config.project_catalog_url.clone()));
    let clock = Arc::new(SystemClock);
    let alerts = Arc::new(LoggingAlertSink);

    let elector = LeaderElector::new(conn, &args.namespace, LOCK_TTL);
    let leadership = elector.leadership();
    tokio::spawn(elector.run());

    let (retry_loop, retry_handle) = RetryLoop::new(Arc::clone(&store), alerts, Arc::clone(&clock), leadership.clone(), RETRY_TICK);
    let retry_loop = Arc::new(retry_loop);
    let retry_handle = Arc::new(retry_handle);

    let reconcile_loop = ReconcileLoop::new(
        Arc::clone(&store),
        retry_handle,
        Arc::clone(&clock),
        leadership.clone(),
        RECONCILE_TICK,
        config.heartbeat_offline_threshold.as_secs(),
    );

    let scheduler_loop = SchedulerLoop::new(Arc::clone(&store), Arc::clone(&queue), projects, Arc::clone(&clock), leadership, SCHEDULER_TICK);

    let scheduler_handle = tokio::spawn(scheduler_loop.run());
    let reconcile_handle = tokio::spawn(reconcile_loop.run());
    let retry_handle_task = tokio::spawn(retry_loop.run());

    tokio::select! {
        res = scheduler_handle => res?,
        res = reconcile_handle => res?,
        res = retry_handle_task => res?,
    }

    Ok(())
}
