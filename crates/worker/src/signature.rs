// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task-dispatch signature verification (spec.md §4.6 item 1): the mirror
//! image of the Gateway's `sign_dispatch` (`crates/gateway/src/service.rs`),
//! over `run_id:issued_at:expires_at:nonce` with HMAC-SHA256.

use std::collections::VecDeque;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignatureError {
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature has expired: expires_at={expires_at}, now={now}")]
    Expired { expires_at: i64, now: i64 },
    #[error("nonce already seen: {0}")]
    ReplayedNonce(String),
    #[error("signature does not match")]
    Mismatch,
}

/// A received dispatch signature, mirroring the wire `TaskSignature` message.
#[derive(Debug, Clone)]
pub struct DispatchSignature {
    pub issued_at: i64,
    pub expires_at: i64,
    pub nonce: String,
    pub signature: String,
    pub algorithm: String,
}

/// Bounded FIFO cache of nonces already accepted, rejecting replays without
/// growing unboundedly (spec.md §4.6 item 1: "nonce uniqueness, bounded cache").
pub struct NonceCache {
    seen: std::collections::HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl NonceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: std::collections::HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` if `nonce` was not seen before and is now recorded.
    pub fn record(&mut self, nonce: &str) -> bool {
        if self.seen.contains(nonce) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(nonce.to_string());
        self.order.push_back(nonce.to_string());
        true
    }
}

/// Verify `sig` against `run_id` using `secret`, checking expiry and nonce
/// uniqueness via `nonces`. `now_ms` is milliseconds; `issued_at`/`expires_at`
/// on the wire are seconds, matching the Gateway's `sign_dispatch`.
pub fn verify_dispatch_signature(
    run_id: &str,
    sig: &DispatchSignature,
    secret: &[u8],
    nonces: &mut NonceCache,
    now_secs: i64,
) -> Result<(), SignatureError> {
    if sig.algorithm != "HMAC-SHA256" {
        return Err(SignatureError::UnsupportedAlgorithm(sig.algorithm.clone()));
    }
    if now_secs > sig.expires_at {
        return Err(SignatureError::Expired {
            expires_at: sig.expires_at,
            now: now_secs,
        });
    }
    if !nonces.record(&sig.nonce) {
        return Err(SignatureError::ReplayedNonce(sig.nonce.clone()));
    }

    let message = format!(
        "{}:{}:{}:{}",
        run_id, sig.issued_at, sig.expires_at, sig.nonce
    );
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    if expected == sig.signature {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(run_id: &str, issued_at: i64, expires_at: i64, nonce: &str, secret: &[u8]) -> String {
        let message = format!("{run_id}:{issued_at}:{expires_at}:{nonce}");
        #[allow(clippy::unwrap_used)]
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let secret = b"topsecret";
        let signature = sign("run-1", 100, 500, "nonce-a", secret);
        let sig = DispatchSignature {
            issued_at: 100,
            expires_at: 500,
            nonce: "nonce-a".into(),
            signature,
            algorithm: "HMAC-SHA256".into(),
        };
        let mut cache = NonceCache::new(16);
        assert!(verify_dispatch_signature("run-1", &sig, secret, &mut cache, 200).is_ok());
    }

    #[test]
    fn expired_signature_is_rejected() {
        let secret = b"topsecret";
        let signature = sign("run-1", 100, 500, "nonce-b", secret);
        let sig = DispatchSignature {
            issued_at: 100,
            expires_at: 500,
            nonce: "nonce-b".into(),
            signature,
            algorithm: "HMAC-SHA256".into(),
        };
        let mut cache = NonceCache::new(16);
        assert!(matches!(
            verify_dispatch_signature("run-1", &sig, secret, &mut cache, 600),
            Err(SignatureError::Expired { .. })
        ));
    }

    #[test]
    fn replayed_nonce_is_rejected_on_second_use() {
        let secret = b"topsecret";
        let signature = sign("run-1", 100, 500, "nonce-c", secret);
        let sig = DispatchSignature {
            issued_at: 100,
            expires_at: 500,
            nonce: "nonce-c".into(),
            signature,
            algorithm: "HMAC-SHA256".into(),
        };
        let mut cache = NonceCache::new(16);
        assert!(verify_dispatch_signature("run-1", &sig, secret, &mut cache, 200).is_ok());
        assert!(matches!(
            verify_dispatch_signature("run-1", &sig, secret, &mut cache, 200),
            Err(SignatureError::ReplayedNonce(_))
        ));
    }

    #[test]
    fn tampered_run_id_fails_mismatch() {
        let secret = b"topsecret";
        let signature = sign("run-1", 100, 500, "nonce-d", secret);
        let sig = DispatchSignature {
            issued_at: 100,
            expires_at: 500,
            nonce: "nonce-d".into(),
            signature,
            algorithm: "HMAC-SHA256".into(),
        };
        let mut cache = NonceCache::new(16);
        assert!(matches!(
            verify_dispatch_signature("run-2", &sig, secret, &mut cache, 200),
            Err(SignatureError::Mismatch)
        ));
    }

    #[test]
    fn nonce_cache_evicts_oldest_past_capacity() {
        let mut cache = NonceCache::new(2);
        assert!(cache.record("a"));
        assert!(cache.record("b"));
        // Inserting "c" evicts "a" to stay within capacity.
        assert!(cache.record("c"));
        // "a" was evicted, so it is accepted again as if new (which in turn
        // evicts "b").
        assert!(cache.record("a"));
        // "c" is still within the two-entry window and remains rejected.
        assert!(!cache.record("c"));
    }
}
