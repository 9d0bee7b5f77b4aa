//! The backing store shared by every ingress instance.
//!
//! The admission pipeline never reads and then writes the store: every state
//! transition goes through one of the atomic primitives below.

mod memory;
mod redis_store;

pub use memory::{MemoryStore, Published};
pub use redis_store::RedisStore;

use async_trait::async_trait;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("unexpected reply from store: {0}")]
    UnexpectedReply(String),
}

/// One admission transaction.
///
/// Executed atomically: the usage counter is incremented and its expiry set,
/// then, based on the post-increment value, either the message is appended
/// and announced on the new-data channel, or the overage is announced on the
/// over-limit channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub project_id: String,
    pub count_key: String,
    pub data_key: String,
    /// Absolute expiry of the usage counter, milliseconds since the epoch
    pub expire_at: i64,
    /// `None` means unlimited
    pub daily_limit: Option<u64>,
    /// JSON-serialized [`crate::message::SerializedMessage`]
    pub message: String,
    /// Admission time, milliseconds since the epoch
    pub now: i64,
}

impl Commit {
    pub fn remaining_time(&self) -> i64 {
        self.expire_at - self.now
    }

    /// Returns true when `usage` breaches the daily limit.
    pub fn is_over_limit(&self, usage: u64) -> bool {
        self.daily_limit.is_some_and(|limit| usage > limit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored { usage: u64 },
    OverLimit { usage: u64 },
}

impl CommitOutcome {
    pub fn usage(&self) -> u64 {
        match self {
            CommitOutcome::Stored { usage } | CommitOutcome::OverLimit { usage } => *usage,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically increments `key` and sets it to expire at `expire_at`
    /// (milliseconds since the epoch). Returns the post-increment value.
    async fn incr_with_expiry(&self, key: &str, expire_at: i64) -> Result<u64, StoreError>;

    async fn commit(&self, commit: &Commit) -> Result<CommitOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
