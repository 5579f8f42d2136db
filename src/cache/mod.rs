//! Small KV store backing the key pool's runtime state.
//!
//! Two backends share one interface: an in-process store for single-node
//! deployments and tests, and Redis for multi-node deployments. Operations
//! that must be atomic across processes (list rotation, the failure-count
//! demotion, promotion) are single Redis commands or Lua scripts; the memory
//! backend performs the same transitions under one mutex guard.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::KvConfig;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connection(String),
    #[error("kv error: {0}")]
    Backend(String),
    #[error("wrong value type for key {0}")]
    WrongType(String),
}

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Increment a counter, applying `ttl` when the counter is created.
    async fn incr(&self, key: &str, ttl: Duration) -> KvResult<i64>;

    /// Atomically pop the head of the list, push it to the tail and return
    /// it. Concurrent callers each observe a distinct cyclic position.
    async fn rotate(&self, key: &str) -> KvResult<Option<String>>;
    async fn list_push(&self, key: &str, values: &[String]) -> KvResult<()>;
    /// Remove all occurrences of `value`; returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> KvResult<usize>;
    async fn list_len(&self, key: &str) -> KvResult<usize>;
    async fn list_all(&self, key: &str) -> KvResult<Vec<String>>;

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> KvResult<bool>;
    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;

    /// Compound failure-accounting op: increment `counter` (with `ttl` on
    /// creation) and, when the new value reaches `threshold`, move `member`
    /// from `active_list` into `invalid_set`. Returns the counter value and
    /// whether the move happened. The move fires at most once because the
    /// member is only ever present in the list the first time the threshold
    /// is crossed.
    async fn incr_and_demote(
        &self,
        counter: &str,
        ttl: Duration,
        threshold: i64,
        active_list: &str,
        invalid_set: &str,
        member: &str,
    ) -> KvResult<(i64, bool)>;

    /// Compound promotion op: move `member` from `invalid_set` onto
    /// `active_list` and clear `counter`. Returns false when the member was
    /// not in the set (already promoted or never demoted).
    async fn promote_member(
        &self,
        invalid_set: &str,
        active_list: &str,
        member: &str,
        counter: &str,
    ) -> KvResult<bool>;

    async fn ping(&self) -> KvResult<()>;
}

/// Build the configured backend. Falls back to the in-memory store when no
/// Redis address is configured.
pub async fn connect(config: &KvConfig) -> KvResult<std::sync::Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "redis" => {
            let store = RedisStore::connect(&config.redis_url).await?;
            Ok(std::sync::Arc::new(store))
        }
        _ => Ok(std::sync::Arc::new(MemoryStore::new())),
    }
}
