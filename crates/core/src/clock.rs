// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Time source abstraction so scheduling and timeout logic can be tested
//! without wall-clock sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current time, expressed as epoch milliseconds.
///
/// Every component that makes a timing decision (heartbeat freshness,
/// retry backoff, lease TTLs) takes `&dyn Clock` rather than calling
/// `SystemTime::now()` directly.
pub trait Clock: Send + Sync {
    fn epoch_ms(&self) -> u64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock tests can advance deterministically.
#[derive(Debug, Default)]
pub struct FakeClock {
    now_ms: AtomicU64,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: u64) {
        self.now_ms.store(value, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn epoch_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_by_delta() {
        let clock = FakeClock::new(100);
        assert_eq!(clock.epoch_ms(), 100);
        clock.advance_ms(50);
        assert_eq!(clock.epoch_ms(), 150);
    }

    #[test]
    fn fake_clock_set_overrides_value() {
        let clock = FakeClock::new(0);
        clock.set_ms(9_999);
        assert_eq!(clock.epoch_ms(), 9_999);
    }

    #[test]
    fn system_clock_returns_nonzero_epoch() {
        assert!(SystemClock.epoch_ms() > 0);
    }
}
