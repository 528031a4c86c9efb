// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Gateway's authentication chain (spec.md §4.5, §6): optional mTLS,
//! then API key + Worker ID headers, then a Bearer token, first success
//! wins. Health checks and `Register` bypass this entirely.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tonic::metadata::MetadataMap;
use tonic::Status;

use antcode_core::model::WorkerId;

/// Identity established by whichever auth layer succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub worker_id: WorkerId,
    pub layer: AuthLayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLayer {
    Mtls,
    ApiKey,
    BearerToken,
}

/// Looks up the credentials a Worker registered with. Backed by the
/// metadata store's Worker records in the composition root.
pub trait WorkerCredentialStore: Send + Sync {
    fn verify_api_key(&self, worker_id: &str, api_key: &str) -> bool;
    /// The HMAC secret used to sign bearer tokens for this Worker, if known.
    fn bearer_secret(&self, worker_id: &str) -> Option<Vec<u8>>;
}

/// Peer certificate presence, extracted from the TLS layer by the server
/// before the handler runs. `None` when the connection isn't over mTLS or
/// the peer presented no certificate.
#[derive(Debug, Clone)]
pub struct PeerCertInfo {
    pub verified_worker_id: WorkerId,
}

fn header(metadata: &MetadataMap, name: &str) -> Option<String> {
    metadata.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// A minimal HMAC-SHA256 bearer scheme: `base64url(worker_id).base64url(hmac_sha256(worker_id, secret))`.
/// Not a general JWT decoder; the Gateway only ever validates tokens it (or
/// the Master) issued, so there is no need to support arbitrary claims.
fn verify_bearer_token(token: &str, store: &dyn WorkerCredentialStore) -> Option<WorkerId> {
    let (payload_b64, sig_b64) = token.split_once('.')?;
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let worker_id_bytes = engine.decode(payload_b64).ok()?;
    let worker_id = String::from_utf8(worker_id_bytes).ok()?;
    let secret = store.bearer_secret(&worker_id)?;
    let sig = engine.decode(sig_b64).ok()?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&secret).ok()?;
    mac.update(worker_id.as_bytes());
    mac.verify_slice(&sig).ok()?;

    Some(WorkerId::new(worker_id))
}

/// Run the three auth layers in priority order; the first that succeeds
/// wins. Returns `UNAUTHENTICATED` if none do.
pub fn authenticate(
    metadata: &MetadataMap,
    peer_cert: Option<&PeerCertInfo>,
    store: &dyn WorkerCredentialStore,
) -> Result<AuthContext, Status> {
    if let Some(cert) = peer_cert {
        return Ok(AuthContext {
            worker_id: cert.verified_worker_id.clone(),
            layer: AuthLayer::Mtls,
        });
    }

    if let (Some(api_key), Some(worker_id)) = (header(metadata, "x-api-key"), header(metadata, "x-worker-id")) {
        if store.verify_api_key(&worker_id, &api_key) {
            return Ok(AuthContext {
                worker_id: WorkerId::new(worker_id),
                layer: AuthLayer::ApiKey,
            });
        }
        return Err(Status::unauthenticated("invalid api key"));
    }

    if let Some(auth_header) = header(metadata, "authorization") {
        if let Some(token) = auth_header.strip_prefix("Bearer ").or_else(|| auth_header.strip_prefix("bearer ")) {
            if let Some(worker_id) = verify_bearer_token(token.trim(), store) {
                return Ok(AuthContext {
                    worker_id,
                    layer: AuthLayer::BearerToken,
                });
            }
        }
        return Err(Status::unauthenticated("invalid bearer token"));
    }

    Err(Status::unauthenticated("no credentials supplied"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStore;

    impl WorkerCredentialStore for FakeStore {
        fn verify_api_key(&self, worker_id: &str, api_key: &str) -> bool {
            worker_id == "w-1" && api_key == "correct-key"
        }

        fn bearer_secret(&self, worker_id: &str) -> Option<Vec<u8>> {
            (worker_id == "w-1").then(|| b"top-secret".to_vec())
        }
    }

    fn metadata_with(pairs: &[(&str, &str)]) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for (k, v) in pairs {
            metadata.insert(*k, v.parse().unwrap());
        }
        metadata
    }

    fn sign(worker_id: &str, secret: &[u8]) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(worker_id.as_bytes());
        let sig = mac.finalize().into_bytes();
        format!("{}.{}", engine.encode(worker_id), engine.encode(sig))
    }

    #[test]
    fn api_key_layer_succeeds_with_matching_credentials() {
        let metadata = metadata_with(&[("x-api-key", "correct-key"), ("x-worker-id", "w-1")]);
        let ctx = authenticate(&metadata, None, &FakeStore).unwrap();
        assert_eq!(ctx.layer, AuthLayer::ApiKey);
        assert_eq!(ctx.worker_id, WorkerId::new("w-1"));
    }

    #[test]
    fn api_key_layer_rejects_wrong_key() {
        let metadata = metadata_with(&[("x-api-key", "wrong"), ("x-worker-id", "w-1")]);
        let err = authenticate(&metadata, None, &FakeStore).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn bearer_token_layer_verifies_hmac_signature() {
        let token = sign("w-1", b"top-secret");
        let metadata = metadata_with(&[("authorization", &format!("Bearer {token}"))]);
        let ctx = authenticate(&metadata, None, &FakeStore).unwrap();
        assert_eq!(ctx.layer, AuthLayer::BearerToken);
    }

    #[test]
    fn mtls_layer_takes_priority_over_headers() {
        let metadata = metadata_with(&[("x-api-key", "wrong"), ("x-worker-id", "w-1")]);
        let cert = PeerCertInfo {
            verified_worker_id: WorkerId::new("w-2"),
        };
        let ctx = authenticate(&metadata, Some(&cert), &FakeStore).unwrap();
        assert_eq!(ctx.layer, AuthLayer::Mtls);
        assert_eq!(ctx.worker_id, WorkerId::new("w-2"));
    }

    #[test]
    fn no_credentials_is_unauthenticated() {
        let metadata = MetadataMap::new();
        let err = authenticate(&metadata, None, &FakeStore).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
