//! Daily usage accounting per project.
//!
//! Each project has one counter per UTC day. The counter is never reset
//! explicitly: every increment refreshes its expiry to the next UTC midnight
//! and the store drops it at that instant.

use crate::keys::{KeyKind, project_key};
use crate::store::{Commit, CommitOutcome, Store, StoreError};
use std::sync::Arc;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// The first UTC midnight strictly after `now` (milliseconds since the epoch).
///
/// At exactly midnight this is the following midnight, 24h later.
pub fn next_utc_midnight(now: i64) -> i64 {
    now.div_euclid(MS_PER_DAY) * MS_PER_DAY + MS_PER_DAY
}

/// Owner of the per-project usage counters.
///
/// The counter is only ever incremented as part of an admission commit, so
/// the usage a message is judged by is the usage that gets persisted.
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn Store>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        UsageLedger { store }
    }

    pub fn count_key(project_id: &str) -> String {
        project_key(project_id, KeyKind::Count)
    }

    /// Expiry given to the counter when a message is counted at `now`.
    pub fn expires_at(now: i64) -> i64 {
        next_utc_midnight(now)
    }

    /// Counts one message and returns today's usage including it, storing or
    /// rejecting the message in the same atomic round trip.
    pub async fn increment_and_get(&self, commit: &Commit) -> Result<CommitOutcome, StoreError> {
        self.store.commit(commit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use crate::store::MemoryStore;

    fn ms(rfc3339: &str) -> i64 {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .timestamp_millis()
    }

    fn commit(project_id: &str, now: i64, daily_limit: Option<u64>) -> Commit {
        Commit {
            project_id: project_id.into(),
            count_key: UsageLedger::count_key(project_id),
            data_key: project_key(project_id, KeyKind::Data),
            expire_at: UsageLedger::expires_at(now),
            daily_limit,
            message: "{}".into(),
            now,
        }
    }

    #[test]
    fn test_next_utc_midnight() {
        assert_eq!(
            next_utc_midnight(ms("2020-01-01T00:00:00.000Z")),
            ms("2020-01-02T00:00:00.000Z")
        );
        assert_eq!(
            next_utc_midnight(ms("2020-01-01T23:59:59.999Z")),
            ms("2020-01-02T00:00:00.000Z")
        );
        assert_eq!(
            next_utc_midnight(ms("2020-01-02T00:00:00.000Z")),
            ms("2020-01-03T00:00:00.000Z")
        );
        assert_eq!(
            next_utc_midnight(ms("2020-01-01T12:34:56.789+05:00")),
            ms("2020-01-02T00:00:00.000Z")
        );
    }

    #[test]
    fn test_next_utc_midnight_before_epoch() {
        assert_eq!(
            next_utc_midnight(ms("1969-12-31T12:00:00.000Z")),
            ms("1970-01-01T00:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_increment_and_get() {
        let store = Arc::new(MemoryStore::new());
        let ledger = UsageLedger::new(store.clone());
        let now = Utc::now().timestamp_millis();

        let first = ledger.increment_and_get(&commit("foo", now, None)).await.unwrap();
        let second = ledger.increment_and_get(&commit("foo", now, None)).await.unwrap();
        assert_eq!(first.usage(), 1);
        assert_eq!(second.usage(), 2);
        assert_eq!(store.counter("foo.count"), Some(2));
        assert_eq!(store.counter("bar.count"), None);
        assert_eq!(store.expiry("foo.count"), Some(next_utc_midnight(now)));
    }

    #[tokio::test]
    async fn test_over_limit_still_counts() {
        let store = Arc::new(MemoryStore::new());
        let ledger = UsageLedger::new(store.clone());
        let now = Utc::now().timestamp_millis();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(ledger.increment_and_get(&commit("foo", now, Some(2))).await.unwrap());
        }
        assert_eq!(
            outcomes,
            vec![
                CommitOutcome::Stored { usage: 1 },
                CommitOutcome::Stored { usage: 2 },
                CommitOutcome::OverLimit { usage: 3 },
            ]
        );
        assert_eq!(store.counter("foo.count"), Some(3));
    }

    #[tokio::test]
    async fn test_counter_resets_after_midnight() {
        let store = Arc::new(MemoryStore::new());
        let ledger = UsageLedger::new(store.clone());
        // A counter written yesterday expired at today's midnight.
        let yesterday = Utc::now().timestamp_millis() - 24 * 60 * 60 * 1000;

        let outcome = ledger.increment_and_get(&commit("foo", yesterday, None)).await.unwrap();
        assert_eq!(outcome.usage(), 1);
        assert_eq!(store.counter("foo.count"), None);

        let now = Utc::now().timestamp_millis();
        let outcome = ledger.increment_and_get(&commit("foo", now, None)).await.unwrap();
        assert_eq!(outcome.usage(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let ledger = UsageLedger::new(store.clone());
        let now = Utc::now().timestamp_millis();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let ledger = ledger.clone();
            tasks.spawn(async move {
                ledger
                    .increment_and_get(&commit("foo", now, None))
                    .await
                    .unwrap()
                    .usage()
            });
        }
        let mut seen: Vec<u64> = tasks.join_all().await;
        seen.sort_unstable();

        assert_eq!(seen, (1..=100).collect::<Vec<_>>());
        assert_eq!(store.counter("foo.count"), Some(100));
    }
}
