use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::{DEFAULT_WAITING_TTL, WaitingEntry, WaitingList};
use crate::error::{CoordinationError, Result};

const KEY_INDEX: &str = "cpn:wl-keys";
const WAITING_PREFIX: &str = "cpn:wl:";

/// KEYS: waiting zset, issued set, key index.
/// ARGV: member, score, ttl seconds, logical key.
/// Returns the member's rank, or -1 if it was already issued.
const INSERT_SCRIPT: &str = r"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
    return -1
end
redis.call('ZADD', KEYS[1], 'NX', ARGV[2], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('SADD', KEYS[3], ARGV[4])
redis.call('EXPIRE', KEYS[3], ARGV[3])
return redis.call('ZRANK', KEYS[1], ARGV[1])
";

/// KEYS: key index. ARGV: waiting zset prefix.
/// Drops index entries whose list has drained or expired and returns the rest.
const LIVE_KEYS_SCRIPT: &str = r"
local live = {}
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    if redis.call('EXISTS', ARGV[1] .. key) == 1 then
        table.insert(live, key)
    else
        redis.call('SREM', KEYS[1], key)
    end
end
return live
";

/// Waiting lists stored as Redis sorted sets.
///
/// Layout per logical key `k`:
/// - `cpn:wl:k` sorted set of members scored by arrival
/// - `cpn:isu:k` set of members already issued a unit
///
/// `cpn:wl-keys` indexes the logical keys. It shares the lists' TTL and is
/// pruned of drained lists whenever it is read.
#[derive(Clone)]
pub struct RedisWaitingList {
    conn_manager: ConnectionManager,
    insert: Script,
    live_keys: Script,
    ttl: Duration,
}

impl RedisWaitingList {
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
            insert: Script::new(INSERT_SCRIPT),
            live_keys: Script::new(LIVE_KEYS_SCRIPT),
            ttl: DEFAULT_WAITING_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn waiting_key(key: &str) -> String {
        format!("{WAITING_PREFIX}{key}")
    }

    fn issued_key(key: &str) -> String {
        format!("cpn:isu:{key}")
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX).max(1)
    }
}

fn to_entry((member, score): (String, f64)) -> WaitingEntry {
    WaitingEntry {
        member,
        score: score as u64,
    }
}

#[async_trait]
impl WaitingList for RedisWaitingList {
    async fn insert(&self, key: &str, member: &str, score: u64) -> Result<u64> {
        let mut conn = self.conn_manager.clone();
        let rank: i64 = self
            .insert
            .key(Self::waiting_key(key))
            .key(Self::issued_key(key))
            .key(KEY_INDEX)
            .arg(member)
            .arg(score)
            .arg(self.ttl_secs())
            .arg(key)
            .invoke_async(&mut conn)
            .await?;

        if rank < 0 {
            debug!(key, member, "member already issued");
            return Err(CoordinationError::AlreadyIssued {
                key: key.to_string(),
                member: member.to_string(),
            });
        }
        Ok(rank as u64)
    }

    async fn peek_oldest(&self, key: &str) -> Result<Option<WaitingEntry>> {
        let mut conn = self.conn_manager.clone();
        let head: Vec<(String, f64)> = conn
            .zrange_withscores(Self::waiting_key(key), 0, 0)
            .await?;
        Ok(head.into_iter().next().map(to_entry))
    }

    async fn remove_oldest(&self, key: &str) -> Result<Option<WaitingEntry>> {
        let mut conn = self.conn_manager.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(Self::waiting_key(key), 1).await?;
        Ok(popped.into_iter().next().map(to_entry))
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.zrem(Self::waiting_key(key), member).await?;
        Ok(removed > 0)
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn_manager.clone();
        let size: u64 = conn.zcard(Self::waiting_key(key)).await?;
        Ok(size)
    }

    async fn position(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let mut conn = self.conn_manager.clone();
        let rank: Option<u64> = conn.zrank(Self::waiting_key(key), member).await?;
        Ok(rank)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut keys: Vec<String> = self
            .live_keys
            .key(KEY_INDEX)
            .arg(WAITING_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        keys.sort();
        Ok(keys)
    }

    async fn mark_issued(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let issued = Self::issued_key(key);
        let _: () = redis::pipe()
            .atomic()
            .sadd(&issued, member)
            .ignore()
            .expire(&issued, self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_issued(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let issued: bool = conn.sismember(Self::issued_key(key), member).await?;
        Ok(issued)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(Self::waiting_key(key))
            .ignore()
            .srem(KEY_INDEX, key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_issued(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(Self::issued_key(key)).await?;
        Ok(())
    }
}
