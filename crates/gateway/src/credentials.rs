// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapts the metadata store's Worker records to the auth chain's
//! credential lookup (spec.md §4.5).

use std::sync::Arc;

use antcode_core::metadata_store::MetadataStore;
use antcode_core::model::WorkerId;

use crate::auth::WorkerCredentialStore;

pub struct MetadataWorkerCredentials<S> {
    store: Arc<S>,
}

impl<S> MetadataWorkerCredentials<S>
where
    S: MetadataStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> WorkerCredentialStore for MetadataWorkerCredentials<S>
where
    S: MetadataStore,
{
    fn verify_api_key(&self, worker_id: &str, api_key: &str) -> bool {
        match self.store.get_worker(&WorkerId::new(worker_id)) {
            Ok(worker) => worker.api_key.as_deref() == Some(api_key),
            Err(_) => false,
        }
    }

    fn bearer_secret(&self, worker_id: &str) -> Option<Vec<u8>> {
        let worker = self.store.get_worker(&WorkerId::new(worker_id)).ok()?;
        worker.secret.map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_core::metadata_store::InMemoryMetadataStore;
    use antcode_core::model::{MetricsSnapshot, TransportMode, Worker, WorkerStatus};

    fn worker() -> Worker {
        Worker {
            id: WorkerId::new("w-1"),
            name: "w-1".into(),
            host: "10.0.0.1".into(),
            port: 7000,
            region: "us-east".into(),
            transport: TransportMode::Gateway,
            api_key: Some("correct-key".into()),
            secret: Some("top-secret".into()),
            capabilities: Default::default(),
            status: WorkerStatus::Online,
            last_heartbeat_ms: Some(0),
            metrics: MetricsSnapshot::default(),
            os: "linux".into(),
            arch: "x86_64".into(),
            streams: vec![],
        }
    }

    #[test]
    fn verify_api_key_checks_stored_worker() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put_worker(worker()).unwrap();
        let creds = MetadataWorkerCredentials::new(store);
        assert!(creds.verify_api_key("w-1", "correct-key"));
        assert!(!creds.verify_api_key("w-1", "wrong"));
        assert!(!creds.verify_api_key("unknown", "correct-key"));
    }

    #[test]
    fn bearer_secret_returns_none_for_unknown_worker() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let creds = MetadataWorkerCredentials::new(store);
        assert_eq!(creds.bearer_secret("nope"), None);
    }
}
