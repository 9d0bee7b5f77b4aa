//! Runs against a live Redis. Start one and run with
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test -p ingress -- --ignored`.

use chrono::Utc;
use ingress::keys::{KeyKind, project_key};
use ingress::ledger::UsageLedger;
use ingress::message::{Channel, OverageStats, SerializedMessage};
use ingress::store::{Commit, CommitOutcome, RedisStore, Store};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::oneshot;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty())
}

fn commit(project_id: &str, now: i64, daily_limit: Option<u64>, perf: i64) -> Commit {
    let message = SerializedMessage {
        payload: "v1.naclbox.abc".into(),
        received: now,
        perf,
        country: None,
    };
    Commit {
        project_id: project_id.into(),
        count_key: UsageLedger::count_key(project_id),
        data_key: project_key(project_id, KeyKind::Data),
        expire_at: UsageLedger::expires_at(now),
        daily_limit,
        message: serde_json::to_string(&message).unwrap(),
        now,
    }
}

/// Subscribes on a blocking connection and hands back the first message
/// published on `channel`, or `None` after `timeout`.
async fn first_message(
    url: &str,
    channel: &'static str,
    timeout: Duration,
) -> tokio::task::JoinHandle<Option<String>> {
    let client = redis::Client::open(url).unwrap();
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = tokio::task::spawn_blocking(move || {
        let mut conn = client.get_connection().unwrap();
        let mut pubsub = conn.as_pubsub();
        pubsub.subscribe(channel).unwrap();
        pubsub.set_read_timeout(Some(timeout)).unwrap();
        ready_tx.send(()).unwrap();
        let message = pubsub.get_message().ok()?;
        message.get_payload::<String>().ok()
    });
    ready_rx.await.unwrap();
    handle
}

#[tokio::test]
#[ignore]
async fn test_commit_over_limit() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let store = RedisStore::connect(&url).await.unwrap();
    store.ping().await.unwrap();

    let now = Utc::now().timestamp_millis();
    let project_id = format!("it-{}-{now}", std::process::id());
    let over_limit = first_message(&url, Channel::OverLimit.as_str(), Duration::from_secs(5)).await;

    let mut outcomes = Vec::new();
    for perf in 1..=3 {
        outcomes.push(store.commit(&commit(&project_id, now, Some(2), perf)).await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![
            CommitOutcome::Stored { usage: 1 },
            CommitOutcome::Stored { usage: 2 },
            CommitOutcome::OverLimit { usage: 3 },
        ]
    );

    let body = over_limit.await.unwrap().expect("over-limit message");
    let stats: OverageStats = serde_json::from_str(&body).unwrap();
    assert_eq!(stats.project_id, project_id);
    assert_eq!(stats.usage, 3);
    assert_eq!(stats.over_usage, 1);
    assert_eq!(stats.current_time, now);
    assert_eq!(stats.remaining_time, UsageLedger::expires_at(now) - now);

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let data_key = project_key(&project_id, KeyKind::Data);
    let count_key = UsageLedger::count_key(&project_id);

    let len: usize = conn.llen(&data_key).await.unwrap();
    assert_eq!(len, 2);
    let newest: String = conn.lindex(&data_key, 0).await.unwrap();
    let newest: SerializedMessage = serde_json::from_str(&newest).unwrap();
    assert_eq!(newest.perf, 2);

    let usage: u64 = conn.get(&count_key).await.unwrap();
    assert_eq!(usage, 3);
    let ttl: i64 = conn.pttl(&count_key).await.unwrap();
    assert!(ttl > 0 && ttl <= UsageLedger::expires_at(now) - now);

    let _: () = conn.del(vec![data_key.clone(), count_key.clone()]).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_commit_unlimited_announces_new_data() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let store = RedisStore::connect(&url).await.unwrap();

    let now = Utc::now().timestamp_millis();
    let project_id = format!("it-{}-{now}-open", std::process::id());
    let new_data =
        first_message(&url, Channel::NewDataAvailable.as_str(), Duration::from_secs(5)).await;

    let outcome = store.commit(&commit(&project_id, now, None, 7)).await.unwrap();
    assert_eq!(outcome, CommitOutcome::Stored { usage: 1 });

    let data_key = project_key(&project_id, KeyKind::Data);
    assert_eq!(new_data.await.unwrap().as_deref(), Some(data_key.as_str()));

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let count_key = UsageLedger::count_key(&project_id);
    let _: () = conn.del(vec![data_key.clone(), count_key.clone()]).await.unwrap();
}
