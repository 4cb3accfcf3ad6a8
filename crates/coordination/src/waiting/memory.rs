use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DEFAULT_WAITING_TTL, WaitingEntry, WaitingList};
use crate::error::{CoordinationError, Result};

struct Waiting {
    ordered: BTreeSet<(u64, String)>,
    scores: HashMap<String, u64>,
    expires_at: Instant,
}

struct Issued {
    members: HashSet<String>,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    waiting: HashMap<String, Waiting>,
    issued: HashMap<String, Issued>,
}

impl State {
    fn purge(&mut self, key: &str, now: Instant) {
        if self.waiting.get(key).is_some_and(|w| w.expires_at <= now) {
            self.waiting.remove(key);
        }
        if self.issued.get(key).is_some_and(|i| i.expires_at <= now) {
            self.issued.remove(key);
        }
    }

    fn waiting(&mut self, key: &str, now: Instant) -> Option<&mut Waiting> {
        self.purge(key, now);
        self.waiting.get_mut(key)
    }
}

/// Process-local waiting lists with lazy expiry.
pub struct InMemoryWaitingList {
    ttl: Duration,
    state: Mutex<State>,
}

impl Default for InMemoryWaitingList {
    fn default() -> Self {
        Self::new(DEFAULT_WAITING_TTL)
    }
}

impl InMemoryWaitingList {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State, Instant) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state, Instant::now())
    }
}

#[async_trait]
impl WaitingList for InMemoryWaitingList {
    async fn insert(&self, key: &str, member: &str, score: u64) -> Result<u64> {
        let ttl = self.ttl;
        self.with_state(|state, now| {
            state.purge(key, now);
            if state
                .issued
                .get(key)
                .is_some_and(|i| i.members.contains(member))
            {
                return Err(CoordinationError::AlreadyIssued {
                    key: key.to_string(),
                    member: member.to_string(),
                });
            }

            let waiting = state.waiting.entry(key.to_string()).or_insert_with(|| Waiting {
                ordered: BTreeSet::new(),
                scores: HashMap::new(),
                expires_at: now + ttl,
            });
            waiting.expires_at = now + ttl;
            let score = *waiting.scores.entry(member.to_string()).or_insert(score);
            waiting.ordered.insert((score, member.to_string()));

            Ok(waiting.ordered.range(..(score, member.to_string())).count() as u64)
        })
    }

    async fn peek_oldest(&self, key: &str) -> Result<Option<WaitingEntry>> {
        Ok(self.with_state(|state, now| {
            let waiting = state.waiting(key, now)?;
            let (score, member) = waiting.ordered.first()?;
            Some(WaitingEntry {
                member: member.clone(),
                score: *score,
            })
        }))
    }

    async fn remove_oldest(&self, key: &str) -> Result<Option<WaitingEntry>> {
        Ok(self.with_state(|state, now| {
            let waiting = state.waiting(key, now)?;
            let (score, member) = waiting.ordered.pop_first()?;
            waiting.scores.remove(&member);
            Some(WaitingEntry { member, score })
        }))
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.with_state(|state, now| {
            let Some(waiting) = state.waiting(key, now) else {
                return false;
            };
            match waiting.scores.remove(member) {
                Some(score) => waiting.ordered.remove(&(score, member.to_string())),
                None => false,
            }
        }))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        Ok(self.with_state(|state, now| {
            state
                .waiting(key, now)
                .map_or(0, |w| w.ordered.len() as u64)
        }))
    }

    async fn position(&self, key: &str, member: &str) -> Result<Option<u64>> {
        Ok(self.with_state(|state, now| {
            let waiting = state.waiting(key, now)?;
            let score = *waiting.scores.get(member)?;
            Some(waiting.ordered.range(..(score, member.to_string())).count() as u64)
        }))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.with_state(|state, now| {
            state
                .waiting
                .retain(|_, w| w.expires_at > now && !w.ordered.is_empty());
            let mut keys: Vec<_> = state.waiting.keys().cloned().collect();
            keys.sort();
            keys
        }))
    }

    async fn mark_issued(&self, key: &str, member: &str) -> Result<()> {
        let ttl = self.ttl;
        self.with_state(|state, now| {
            state.purge(key, now);
            let issued = state.issued.entry(key.to_string()).or_insert_with(|| Issued {
                members: HashSet::new(),
                expires_at: now + ttl,
            });
            issued.expires_at = now + ttl;
            issued.members.insert(member.to_string());
        });
        Ok(())
    }

    async fn is_issued(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.with_state(|state, now| {
            state.purge(key, now);
            state
                .issued
                .get(key)
                .is_some_and(|i| i.members.contains(member))
        }))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.with_state(|state, _| state.waiting.remove(key));
        Ok(())
    }

    async fn clear_issued(&self, key: &str) -> Result<()> {
        self.with_state(|state, _| state.issued.remove(key));
        Ok(())
    }
}
