use super::{KvError, KvResult, KvStore};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Direction, Script, aio::ConnectionManager};
use std::time::Duration;

// INCR with TTL applied on creation, so a counter window starts at the first
// failure and isolated failures age out.
const INCR_SCRIPT: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

// Failure accounting as one script: the increment, the threshold check and
// the active->invalid move cannot interleave between processes.
const DEMOTE_SCRIPT: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local moved = 0
if v >= tonumber(ARGV[2]) then
  local removed = redis.call('LREM', KEYS[2], 0, ARGV[3])
  if removed > 0 then
    redis.call('SADD', KEYS[3], ARGV[3])
    moved = 1
  end
end
return {v, moved}
"#;

const PROMOTE_SCRIPT: &str = r#"
local removed = redis.call('SREM', KEYS[1], ARGV[1])
if removed > 0 then
  redis.call('RPUSH', KEYS[2], ARGV[1])
  redis.call('DEL', KEYS[3])
end
return removed
"#;

/// Redis-backed store shared by all nodes. The connection manager reconnects
/// transparently; callers only see `KvError` on hard failures.
pub struct RedisStore {
    conn: ConnectionManager,
    incr_script: Script,
    demote_script: Script,
    promote_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = Client::open(url).map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            incr_script: Script::new(INCR_SCRIPT),
            demote_script: Script::new(DEMOTE_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
        })
    }
}

fn map_err(e: redis::RedisError) -> KvError {
    KvError::Backend(e.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(d) => conn
                .set_ex(key, value, d.as_secs().max(1))
                .await
                .map_err(map_err),
            None => conn.set(key, value).await.map_err(map_err),
        }
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        self.incr_script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn rotate(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.lmove(key, key, Direction::Left, Direction::Right)
            .await
            .map_err(map_err)
    }

    async fn list_push(&self, key: &str, values: &[String]) -> KvResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(key, values).await.map_err(map_err)?;
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(key, 0, value).await.map_err(map_err)?;
        Ok(removed as usize)
    }

    async fn list_len(&self, key: &str) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(key).await.map_err(map_err)?;
        Ok(len as usize)
    }

    async fn list_all(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, -1).await.map_err(map_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await.map_err(map_err)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(map_err)
    }

    async fn incr_and_demote(
        &self,
        counter: &str,
        ttl: Duration,
        threshold: i64,
        active_list: &str,
        invalid_set: &str,
        member: &str,
    ) -> KvResult<(i64, bool)> {
        let mut conn = self.conn.clone();
        let (count, moved): (i64, i64) = self
            .demote_script
            .key(counter)
            .key(active_list)
            .key(invalid_set)
            .arg(ttl.as_secs().max(1))
            .arg(threshold)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok((count, moved == 1))
    }

    async fn promote_member(
        &self,
        invalid_set: &str,
        active_list: &str,
        member: &str,
        counter: &str,
    ) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .promote_script
            .key(invalid_set)
            .key(active_list)
            .key(counter)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)
    }
}
