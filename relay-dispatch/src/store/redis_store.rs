use super::{BoundedIncr, CounterStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

// GET + INCR must not interleave with another process's admit.
const INCR_BELOW_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
return {1, redis.call('INCR', KEYS[1])}
"#;

const DECR_DELETE_AT_ZERO_SCRIPT: &str = r#"
local value = redis.call('DECR', KEYS[1])
if value <= 0 then
  redis.call('DEL', KEYS[1])
end
return value
"#;

// The cardinality must be the one this SADD produced, not one read after another add.
const SET_ADD_CARD_SCRIPT: &str = r#"
local added = redis.call('SADD', KEYS[1], ARGV[1])
return {added, redis.call('SCARD', KEYS[1])}
"#;

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    incr_below: redis::Script,
    decr_delete: redis::Script,
    set_add_card: redis::Script,
}

impl RedisStore {
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("open redis client: {e}")))?;
        let manager = client.get_connection_manager().await?;
        tracing::info!("redis connection manager ready");
        Ok(Self {
            manager,
            incr_below: redis::Script::new(INCR_BELOW_SCRIPT),
            decr_delete: redis::Script::new(DECR_DELETE_AT_ZERO_SCRIPT),
            set_add_card: redis::Script::new(SET_ADD_CARD_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_below(&self, key: &str, limit: i64) -> StoreResult<BoundedIncr> {
        let mut conn = self.manager.clone();
        let (incremented, value): (i64, i64) = self
            .incr_below
            .key(key)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(if incremented == 1 {
            BoundedIncr::Incremented(value)
        } else {
            BoundedIncr::AtLimit(value)
        })
    }

    async fn decr_delete_at_zero(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        let value: i64 = self.decr_delete.key(key).invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn counter(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_add_card(&self, key: &str, member: &str) -> StoreResult<(bool, u64)> {
        let mut conn = self.manager.clone();
        let (added, card): (i64, u64) = self
            .set_add_card
            .key(key)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok((added > 0, card))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_card(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let card: u64 = conn.scard(key).await?;
        Ok(card)
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }
}
