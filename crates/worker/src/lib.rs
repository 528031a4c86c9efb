// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! antcode-worker: polls or receives task dispatches, fetches and caches
//! project artifacts, prepares runtimes, and executes tasks under a
//! sandbox (spec.md §4.6-§4.9). Speaks to its control plane over either a
//! direct in-process transport or a remote Gateway, chosen at boot.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod engine;
pub mod executor;
pub mod fetcher;
pub mod logs;
pub mod model;
pub mod python_plugin;
pub mod runtime;
pub mod sandbox;
pub mod signature;
pub mod transport;

pub use engine::{PlanBuilder, WorkerEngine};
pub use executor::{Executor, OutputSink, ProcessExecutor};
pub use fetcher::{ArtifactFetcher, FetchError, ProjectCache};
pub use logs::{BatchConfig, BatchSender, LogArchiver};
pub use model::{ArtifactRef, ExecPlan, ExecResult, ExitReason, RunState};
pub use python_plugin::{PipRuntimeBuilder, PythonEntryPointPlanBuilder};
pub use runtime::{RuntimeBuilder, RuntimeManager};
pub use sandbox::{BasicSandbox, NoOpSandbox, SandboxPlan, SandboxProvider};
pub use signature::{verify_dispatch_signature, DispatchSignature, NonceCache, SignatureError};
pub use transport::{DirectTransport, GatewayTransport, Transport, TransportError};
