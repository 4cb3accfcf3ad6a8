use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LockBackend, LockLease};
use crate::error::Result;

struct Held {
    holder: String,
    fencing_token: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    held: HashMap<String, Held>,
    last_token: u64,
}

/// Process-local lock table.
///
/// Fencing tokens come from one counter shared by all keys, so they rise
/// per key without remembering keys nobody holds.
#[derive(Default)]
pub struct InMemoryLockBackend {
    state: Mutex<State>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<Option<LockLease>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = state.held.get(key)
            && current.expires_at > now
        {
            return Ok(None);
        }
        state.held.retain(|_, held| held.expires_at > now);

        state.last_token += 1;
        let fencing_token = state.last_token;
        state.held.insert(
            key.to_string(),
            Held {
                holder: holder.to_string(),
                fencing_token,
                expires_at: now + lease,
            },
        );

        Ok(Some(LockLease {
            key: key.to_string(),
            holder: holder.to_string(),
            fencing_token,
            lease,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let owned = state.held.get(&lease.key).is_some_and(|current| {
            current.holder == lease.holder && current.fencing_token == lease.fencing_token
        });
        if owned {
            state.held.remove(&lease.key);
        }
        Ok(owned)
    }
}
