// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! InstallKey: one-time credential permitting a Worker to self-register.

use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Stable public identifier for an [`InstallKey`] record, distinct from
    /// the opaque bearer value itself.
    pub struct InstallKeyId;
}

/// Optional source-IP binding expressed as a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidrBinding(pub String);

/// A one-time credential permitting a Worker to self-register (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallKey {
    pub id: InstallKeyId,
    /// Opaque bearer value; never logged or returned after creation.
    pub key_value: String,
    pub os_target: String,
    pub source_cidr: Option<CidrBinding>,
    pub expires_at_ms: u64,
    pub consumed: bool,
}

impl InstallKey {
    /// True when this key may still be redeemed: unconsumed, not expired,
    /// and (if bound) the caller's address falls inside the CIDR binding.
    ///
    /// CIDR matching itself lives with the network stack in the Gateway
    /// crate; this only enforces the temporal/consumption half of the rule.
    pub fn is_redeemable(&self, now_ms: u64) -> bool {
        !self.consumed && now_ms < self.expires_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InstallKey {
        InstallKey {
            id: InstallKeyId::new("k-1"),
            key_value: "secret".into(),
            os_target: "linux".into(),
            source_cidr: None,
            expires_at_ms: 1_000,
            consumed: false,
        }
    }

    #[test]
    fn redeemable_before_expiry_and_unconsumed() {
        let k = key();
        assert!(k.is_redeemable(999));
        assert!(!k.is_redeemable(1_000));
    }

    #[test]
    fn consumed_key_is_never_redeemable() {
        let mut k = key();
        k.consumed = true;
        assert!(!k.is_redeemable(0));
    }
}
