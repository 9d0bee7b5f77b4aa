use super::{Commit, CommitOutcome, Store, StoreError};
use crate::message::Channel;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

/// Increments usage, sets its expiry and then takes exactly one branch.
///
/// KEYS: count key, data key.
/// ARGV: expire-at (ms), daily limit (0 = unlimited), serialized message,
/// new-data channel, over-limit channel, project id, current time (ms),
/// remaining time (ms).
///
/// Returns `{stored, usage}` where `stored` is 1 when the message was appended.
const COMMIT_SCRIPT: &str = r#"
local usage = redis.call('INCR', KEYS[1])
redis.call('PEXPIREAT', KEYS[1], ARGV[1])
local limit = tonumber(ARGV[2])
if limit > 0 and usage > limit then
  local stats = cjson.encode({
    projectID = ARGV[6],
    usage = usage,
    overUsage = usage - limit,
    currentTime = tonumber(ARGV[7]),
    remainingTime = tonumber(ARGV[8]),
  })
  redis.call('PUBLISH', ARGV[5], stats)
  return {0, usage}
end
redis.call('LPUSH', KEYS[2], ARGV[3])
redis.call('PUBLISH', ARGV[4], KEYS[2])
return {1, usage}
"#;

/// Redis-backed store. Cloning shares the underlying multiplexed connection,
/// which reconnects on its own after connection loss.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    commit_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            commit_script: Script::new(COMMIT_SCRIPT),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn incr_with_expiry(&self, key: &str, expire_at: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let (usage,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .cmd("PEXPIREAT")
            .arg(key)
            .arg(expire_at)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(usage)
    }

    async fn commit(&self, commit: &Commit) -> Result<CommitOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (stored, usage): (i64, u64) = self
            .commit_script
            .key(&commit.count_key)
            .key(&commit.data_key)
            .arg(commit.expire_at)
            .arg(commit.daily_limit.unwrap_or(0))
            .arg(&commit.message)
            .arg(Channel::NewDataAvailable.as_str())
            .arg(Channel::OverLimit.as_str())
            .arg(&commit.project_id)
            .arg(commit.now)
            .arg(commit.remaining_time())
            .invoke_async(&mut conn)
            .await?;

        match stored {
            1 => Ok(CommitOutcome::Stored { usage }),
            0 => Ok(CommitOutcome::OverLimit { usage }),
            other => Err(StoreError::UnexpectedReply(format!(
                "commit script returned branch {other}"
            ))),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        match reply.as_str() {
            "PONG" => Ok(()),
            _ => Err(StoreError::UnexpectedReply(reply)),
        }
    }
}
