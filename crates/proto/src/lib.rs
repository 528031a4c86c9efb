// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! antcode-proto: the generated gRPC surface between Gateway and Worker,
//! plus the Redis key-naming conventions both sides rely on.

pub mod keys;

pub mod worker {
    include!(concat!(env!("OUT_DIR"), "/antcode.worker.rs"));
}

/// Encoded `FileDescriptorSet` for `antcode.worker`, used to back the
/// gRPC reflection service.
pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/antcode_worker.bin"));
