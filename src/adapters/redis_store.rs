use super::store::CoordinationStore;
use crate::error::{ControlError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Compare the stored record's epoch with ARGV[1]; write ARGV[2] on match.
/// Runs atomically inside Redis.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local epoch = 0
if current then
  local ok, decoded = pcall(cjson.decode, current)
  if not ok then
    return redis.error_reply('corrupt designation record')
  end
  epoch = tonumber(decoded['epoch']) or 0
end
if epoch ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Redis-backed coordination store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Script,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis. Fails fast if the server cannot be reached.
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = tokio::time::timeout(op_timeout * 5, ConnectionManager::new(client))
            .await
            .map_err(|_| ControlError::StoreTimeout(op_timeout * 5))??;

        let store = Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
            op_timeout,
        };
        store.ping().await?;

        info!(url = %redact(redis_url), "Connected to Redis coordination store");
        Ok(store)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    /// Apply the per-call network timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(ControlError::from),
            Err(_) => Err(ControlError::StoreTimeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { redis::cmd("GET").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.bounded(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_epoch: u64,
        new_value: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.cas.key(key);
        invocation.arg(expected_epoch).arg(new_value);

        let swapped: i64 = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;
        debug!(key, expected_epoch, swapped, "CAS executed");
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded(async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Strip credentials from a Redis URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
