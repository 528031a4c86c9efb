// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Distributed leader election with fencing (spec.md §4.1).
//!
//! The lock is a single Redis key holding a random holder token, acquired
//! with `SET key token NX PX ttl`. Release and renewal both go through a
//! compare-and-delete/compare-and-extend Lua script so a stale leader can
//! never clobber a newer one's lock. Every successful acquisition also
//! bumps a monotonic fencing counter (`INCR` on `fencing:token:master`);
//! that counter value is this term's [`FencingToken`], carried by every
//! write the scheduler, reconcile, and retry loops make while leader.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use antcode_proto::keys;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("redis error during election: {0}")]
    Transport(#[from] redis::RedisError),
}

/// The fencing token issued on a successful lock acquisition.
///
/// Persistent decisions made under leader authority should carry this value;
/// consumers accept a write only if its token is `>=` the last one they saw
/// (spec.md §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FencingToken(pub i64);

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Shared view of whether this process currently holds the lock, and at
/// which fencing token. Cheap to clone; read by the loops on every tick.
#[derive(Clone)]
pub struct Leadership {
    is_leader: Arc<AtomicBool>,
    token: Arc<AtomicI64>,
    stepped_down: Arc<Notify>,
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// The fencing token of the current (or most recent) leader term. Only
    /// meaningful while [`is_leader`](Self::is_leader) is true.
    pub fn token(&self) -> FencingToken {
        FencingToken(self.token.load(Ordering::Acquire))
    }

    /// Resolves once leadership is lost, for loops awaiting cancellation
    /// alongside their sleep tick.
    pub async fn wait_for_stepdown(&self) {
        self.stepped_down.notified().await
    }
}

pub struct LeaderElector {
    conn: ConnectionManager,
    lock_key: String,
    holder_token: String,
    ttl: Duration,
    renew_interval: Duration,
    leadership: Leadership,
}

impl LeaderElector {
    pub fn new(conn: ConnectionManager, namespace: &str, ttl: Duration) -> Self {
        Self {
            conn,
            lock_key: format!("{namespace}:lock:leader"),
            holder_token: uuid::Uuid::new_v4().to_string(),
            ttl,
            renew_interval: ttl / 3,
            leadership: Leadership {
                is_leader: Arc::new(AtomicBool::new(false)),
                token: Arc::new(AtomicI64::new(0)),
                stepped_down: Arc::new(Notify::new()),
            },
        }
    }

    pub fn leadership(&self) -> Leadership {
        self.leadership.clone()
    }

    /// Attempt to acquire the lock once. On success, increments the fencing
    /// counter and returns the new term's token.
    async fn try_acquire(&self) -> Result<Option<FencingToken>, ElectionError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(&self.lock_key)
            .arg(&self.holder_token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if !acquired {
            return Ok(None);
        }
        let token: i64 = conn.incr(keys::fencing_counter(), 1).await?;
        Ok(Some(FencingToken(token)))
    }

    async fn renew(&self) -> Result<bool, ElectionError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.lock_key)
            .arg(&self.holder_token)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self) -> Result<(), ElectionError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.lock_key)
            .arg(&self.holder_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    fn step_down(&self) {
        if self.leadership.is_leader.swap(false, Ordering::AcqRel) {
            warn!("stepping down from leadership");
            self.leadership.stepped_down.notify_waiters();
        }
    }

    /// Runs forever: alternates between a follower's acquire-attempt loop
    /// and, once acquired, a renewal loop. Intended to be spawned as its
    /// own task; cancel by dropping the `JoinHandle`.
    pub async fn run(self) {
        loop {
            if !self.leadership.is_leader() {
                match self.try_acquire().await {
                    Ok(Some(token)) => {
                        info!(fencing_token = token.0, "acquired leadership");
                        self.leadership.token.store(token.0, Ordering::Release);
                        self.leadership.is_leader.store(true, Ordering::Release);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "leader acquisition attempt failed"),
                }
                tokio::time::sleep(self.renew_interval).await;
                continue;
            }

            tokio::time::sleep(self.renew_interval).await;
            match self.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("lock renewal found a different holder; stepping down");
                    self.step_down();
                }
                Err(e) => {
                    warn!(error = %e, "lock renewal failed; stepping down voluntarily");
                    self.step_down();
                }
            }
        }
    }

    /// Release the lock and clear leadership state. Call on graceful shutdown.
    pub async fn resign(&self) {
        self.step_down();
        if let Err(e) = self.release().await {
            warn!(error = %e, "failed to release leader lock on resign");
        }
    }
}

#[cfg(test)]
impl Leadership {
    /// Build a detached `Leadership` handle for other crates' tests, with no
    /// backing `LeaderElector` or Redis connection.
    pub fn for_tests(is_leader: bool, token: i64) -> Self {
        Self {
            is_leader: Arc::new(AtomicBool::new(is_leader)),
            token: Arc::new(AtomicI64::new(token)),
            stepped_down: Arc::new(Notify::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fencing_tokens_order_by_value() {
        assert!(FencingToken(2) > FencingToken(1));
    }

    #[test]
    fn fresh_leadership_handle_starts_as_follower() {
        let leadership = Leadership {
            is_leader: Arc::new(AtomicBool::new(false)),
            token: Arc::new(AtomicI64::new(0)),
            stepped_down: Arc::new(Notify::new()),
        };
        assert!(!leadership.is_leader());
        assert_eq!(leadership.token().0, 0);
    }
}
