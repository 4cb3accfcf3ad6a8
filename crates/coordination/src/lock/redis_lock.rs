use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use super::{LockBackend, LockLease};
use crate::error::Result;

/// Sets the lock only if absent and bumps the key's fencing counter.
/// Returns the new token, or 0 when the lock is held.
const ACQUIRE_SCRIPT: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return redis.call('INCR', KEYS[2])
end
return 0
";

/// Deletes the lock only if it still carries the caller's holder id.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Locks stored as Redis keys with a `PX` expiry.
#[derive(Clone)]
pub struct RedisLockBackend {
    conn_manager: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisLockBackend {
    /// Connects to Redis at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(conn_manager))
    }

    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn lock_key(key: &str) -> String {
        format!("lock:{key}")
    }

    fn fence_key(key: &str) -> String {
        format!("lock-fence:{key}")
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<Option<LockLease>> {
        let mut conn = self.conn_manager.clone();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);

        let token: u64 = self
            .acquire
            .key(Self::lock_key(key))
            .key(Self::fence_key(key))
            .arg(holder)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await?;

        if token == 0 {
            debug!(key, "lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(LockLease {
            key: key.to_string(),
            holder: holder.to_string(),
            fencing_token: token,
            lease,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = self
            .release
            .key(Self::lock_key(&lease.key))
            .arg(&lease.holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
