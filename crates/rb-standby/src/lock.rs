//! Renewable lease lock backing leader election.
//!
//! The [`LeaseLock`] trait is the seam between the election protocol and the
//! lock provider, so the protocol can be exercised against an in-memory lock
//! in tests. The production implementation is Redis: `SET NX PX` for
//! acquisition and Lua scripts for atomic compare-and-extend /
//! compare-and-delete.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::{Result, StandbyError};

/// A named lock with a TTL that a single owner can acquire, refresh and
/// release. `false` results mean the lock is held by someone else (or by
/// nobody, for `release`); errors mean the provider could not be reached.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Try to take the lock for `ttl`. Returns `true` on acquisition.
    async fn try_acquire(&self, ttl: Duration) -> Result<bool>;

    /// Extend the lease to `ttl` from now, only if we still own the lock.
    /// Returns `false` if ownership was lost.
    async fn refresh(&self, ttl: Duration) -> Result<bool>;

    /// Delete the lock, only if we still own it. Returns `true` if it was
    /// ours and is now released.
    async fn release(&self) -> Result<bool>;
}

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

/// Redis-backed lease lock. The stored value is the owning instance id, so
/// refresh and release only ever touch a lock we still hold.
pub struct RedisLeaseLock {
    conn: ConnectionManager,
    key: String,
    instance_id: String,
}

impl RedisLeaseLock {
    pub async fn connect(redis_url: &str, key: String, instance_id: String) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key,
            instance_id,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl LeaseLock for RedisLeaseLock {
    async fn try_acquire(&self, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET key instance_id NX PX ttl_ms
        let result: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn refresh(&self, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(&self.key)
            .arg(&self.instance_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn release(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.instance_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }
}
