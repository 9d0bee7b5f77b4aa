//! In-process [`Store`] with the same atomicity as the Redis store.
//!
//! Intended for tests and local development. All operations take a single
//! lock, so every call is atomic relative to every other call. Expiry is
//! evaluated lazily against the wall clock, and an expiry in the past deletes
//! the key immediately, as `PEXPIREAT` does.

use super::{Commit, CommitOutcome, Store, StoreError};
use crate::message::{Channel, OverageStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

const PUBSUB_CAPACITY: usize = 1024;

/// A message delivered on a pub/sub channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub message: String,
}

struct Entry {
    value: String,
    expire_at: Option<i64>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    fn live_string(&mut self, key: &str, now: i64) -> Option<&Entry> {
        let expired = self
            .strings
            .get(key)
            .and_then(|entry| entry.expire_at)
            .is_some_and(|expire_at| expire_at <= now);
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn incr(&mut self, key: &str, now: i64) -> Result<u64, StoreError> {
        let current = match self.live_string(key, now) {
            Some(entry) => entry.value.parse::<u64>().map_err(|_| {
                StoreError::UnexpectedReply(format!("value at {key} is not an integer"))
            })?,
            None => 0,
        };
        let next = current + 1;
        let expire_at = self.strings.get(key).and_then(|entry| entry.expire_at);
        self.strings.insert(
            key.to_owned(),
            Entry {
                value: next.to_string(),
                expire_at,
            },
        );
        Ok(next)
    }

    fn expire_at(&mut self, key: &str, expire_at: i64, now: i64) {
        if expire_at <= now {
            self.strings.remove(key);
        } else if let Some(entry) = self.strings.get_mut(key) {
            entry.expire_at = Some(expire_at);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Published>,
    unavailable: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        MemoryStore {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Plain `SET` without expiry, e.g. to seed a project configuration.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.inner.state.lock().strings.insert(
            key.to_owned(),
            Entry {
                value: value.into(),
                expire_at: None,
            },
        );
    }

    /// Items of the list at `key`, newest first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.inner.state.lock().lists.get(key).map_or(0, VecDeque::len)
    }

    /// Removes and returns the newest item of the list at `key`.
    pub fn pop_newest(&self, key: &str) -> Option<String> {
        self.inner.state.lock().lists.get_mut(key)?.pop_front()
    }

    /// Integer value at `key`, if it exists and is one.
    pub fn counter(&self, key: &str) -> Option<u64> {
        let now = now_millis();
        self.inner
            .state
            .lock()
            .live_string(key, now)
            .and_then(|entry| entry.value.parse().ok())
    }

    /// Absolute expiry of `key` in milliseconds, if it exists and has one.
    pub fn expiry(&self, key: &str) -> Option<i64> {
        let now = now_millis();
        self.inner
            .state
            .lock()
            .live_string(key, now)
            .and_then(|entry| entry.expire_at)
    }

    /// Receives every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.inner.events.subscribe()
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match self.inner.unavailable.load(Ordering::SeqCst) {
            true => Err(StoreError::Unavailable),
            false => Ok(()),
        }
    }

    fn publish(&self, channel: Channel, message: String) {
        // Pub/sub is fire-and-forget; nobody listening is not an error.
        let _ = self.inner.events.send(Published {
            channel: channel.as_str().to_owned(),
            message,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = now_millis();
        let mut state = self.inner.state.lock();
        Ok(state.live_string(key, now).map(|entry| entry.value.clone()))
    }

    async fn incr_with_expiry(&self, key: &str, expire_at: i64) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = now_millis();
        let mut state = self.inner.state.lock();
        let usage = state.incr(key, now)?;
        state.expire_at(key, expire_at, now);
        Ok(usage)
    }

    async fn commit(&self, commit: &Commit) -> Result<CommitOutcome, StoreError> {
        self.check_available()?;
        let now = now_millis();
        let mut state = self.inner.state.lock();
        let usage = state.incr(&commit.count_key, now)?;
        state.expire_at(&commit.count_key, commit.expire_at, now);

        if commit.is_over_limit(usage) {
            let stats = OverageStats {
                project_id: commit.project_id.clone(),
                usage,
                over_usage: usage.saturating_sub(commit.daily_limit.unwrap_or(0)),
                current_time: commit.now,
                remaining_time: commit.remaining_time(),
            };
            let body = serde_json::to_string(&stats)
                .map_err(|e| StoreError::UnexpectedReply(e.to_string()))?;
            self.publish(Channel::OverLimit, body);
            return Ok(CommitOutcome::OverLimit { usage });
        }

        state
            .lists
            .entry(commit.data_key.clone())
            .or_default()
            .push_front(commit.message.clone());
        self.publish(Channel::NewDataAvailable, commit.data_key.clone());
        Ok(CommitOutcome::Stored { usage })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
