// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! antcode-gateway: the authenticated gRPC surface between Gateway and
//! Worker (spec.md §4.5). Owns no scheduling logic; every RPC translates
//! directly into a Queue/Progress/LogStorage/metadata-store operation.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod credentials;
pub mod server;
pub mod service;

pub use auth::{authenticate, AuthContext, AuthLayer, PeerCertInfo, WorkerCredentialStore};
pub use credentials::MetadataWorkerCredentials;
pub use server::start_grpc_server;
pub use service::WorkerGatewayService;
