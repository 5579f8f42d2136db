//! Per-group key pool: active keys in a rotation list, invalid keys in a
//! set awaiting revalidation, failure counters with a short TTL.
//!
//! All membership state lives in the KV store so concurrent processes share
//! one rotation. The database holds the durable copy (status, counters,
//! last_error) and is updated after each KV transition.

use crate::cache::KvStore;
use crate::crypto::EncryptionService;
use crate::database::DatabaseManager;
use crate::database::entities::api_keys;
use crate::error::{AppError, FailureKind};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn active_list_key(group_id: i32) -> String {
    format!("keys:active:{group_id}")
}

fn invalid_set_key(group_id: i32) -> String {
    format!("keys:invalid:{group_id}")
}

fn fail_counter_key(key_id: i32) -> String {
    format!("key:fail:{key_id}")
}

fn key_data_key(key_id: i32) -> String {
    format!("key:data:{key_id}")
}

/// Cached key material for dispatch without a per-request database read.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyData {
    id: i32,
    group_id: i32,
    value: String,
    hash: String,
}

/// A key selected for one upstream attempt.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    pub id: i32,
    pub group_id: i32,
    pub key_value: String,
    pub key_hash: String,
}

pub struct KeyPool {
    store: Arc<dyn KvStore>,
    db: Arc<DatabaseManager>,
    crypto: EncryptionService,
    counter_ttl: Duration,
}

impl KeyPool {
    pub fn new(
        store: Arc<dyn KvStore>,
        db: Arc<DatabaseManager>,
        crypto: EncryptionService,
        counter_ttl: Duration,
    ) -> Self {
        Self {
            store,
            db,
            crypto,
            counter_ttl,
        }
    }

    /// Round-robin selection. Stale ids (keys deleted while still listed)
    /// are dropped from the rotation as they surface.
    pub async fn acquire(&self, group_id: i32) -> Result<KeyHandle, AppError> {
        let list_key = active_list_key(group_id);
        let attempts = self.store.list_len(&list_key).await?.max(1);

        for _ in 0..attempts {
            let Some(id_str) = self.store.rotate(&list_key).await? else {
                break;
            };
            let Ok(key_id) = id_str.parse::<i32>() else {
                self.store.list_remove(&list_key, &id_str).await?;
                continue;
            };
            match self.key_handle(key_id).await? {
                Some(handle) => return Ok(handle),
                None => {
                    warn!(key_id, group_id, "dropping stale key id from rotation");
                    self.store.list_remove(&list_key, &id_str).await?;
                }
            }
        }
        Err(AppError::NoActiveKey(group_id.to_string()))
    }

    async fn key_handle(&self, key_id: i32) -> Result<Option<KeyHandle>, AppError> {
        let data_key = key_data_key(key_id);
        if let Some(raw) = self.store.get(&data_key).await? {
            if let Ok(data) = serde_json::from_str::<KeyData>(&raw) {
                return Ok(Some(KeyHandle {
                    id: data.id,
                    group_id: data.group_id,
                    key_value: data.value,
                    key_hash: data.hash,
                }));
            }
        }

        let Some(model) = self.db.api_keys().find_by_id(key_id).await? else {
            return Ok(None);
        };
        let value = self
            .crypto
            .decrypt(&model.key_value)
            .map_err(|e| AppError::Internal(format!("key {key_id}: {e}")))?;
        self.cache_key_data(&model, &value).await?;
        Ok(Some(KeyHandle {
            id: model.id,
            group_id: model.group_id,
            key_value: value,
            key_hash: model.key_hash,
        }))
    }

    async fn cache_key_data(&self, model: &api_keys::Model, value: &str) -> Result<(), AppError> {
        let data = KeyData {
            id: model.id,
            group_id: model.group_id,
            value: value.to_string(),
            hash: model.key_hash.clone(),
        };
        let raw = serde_json::to_string(&data)
            .map_err(|e| AppError::Internal(format!("serialise key data: {e}")))?;
        self.store.set(&key_data_key(model.id), &raw, None).await?;
        Ok(())
    }

    /// Success resets the failure window and stamps last_used_at.
    pub async fn report_success(&self, key: &KeyHandle) {
        if let Err(e) = self.store.delete(&fail_counter_key(key.id)).await {
            warn!(key_id = key.id, error = %e, "failed to reset failure counter");
        }
        if let Err(e) = self.db.api_keys().record_success(key.id).await {
            warn!(key_id = key.id, error = %e, "failed to persist key success");
        }
    }

    /// Failure accounting. Only key-attributable failures advance the
    /// counter; the active→invalid transition happens exactly once per
    /// threshold crossing, inside a single KV compound op.
    /// Returns whether the key was demoted.
    pub async fn report_failure(
        &self,
        key: &KeyHandle,
        kind: FailureKind,
        threshold: i64,
        error: &str,
    ) -> Result<bool, AppError> {
        if !kind.is_attributable() {
            if let Err(e) = self.db.api_keys().update_last_error(key.id, error).await {
                warn!(key_id = key.id, error = %e, "failed to persist last_error");
            }
            return Ok(false);
        }

        let (count, demoted) = self
            .store
            .incr_and_demote(
                &fail_counter_key(key.id),
                self.counter_ttl,
                threshold,
                &active_list_key(key.group_id),
                &invalid_set_key(key.group_id),
                &key.id.to_string(),
            )
            .await?;

        if demoted {
            counter!("key_demotions_total").increment(1);
            warn!(
                key_id = key.id,
                group_id = key.group_id,
                failures = count,
                "key demoted to invalid"
            );
            self.db.api_keys().mark_invalid(key.id, count, error).await?;
        } else {
            debug!(key_id = key.id, failures = count, threshold, "key failure recorded");
            if let Err(e) = self.db.api_keys().record_failure(key.id, count, error).await {
                warn!(key_id = key.id, error = %e, "failed to persist key failure");
            }
        }
        Ok(demoted)
    }

    /// Move a revalidated key back into rotation. Idempotent.
    pub async fn promote(&self, group_id: i32, key_id: i32) -> Result<bool, AppError> {
        let promoted = self
            .store
            .promote_member(
                &invalid_set_key(group_id),
                &active_list_key(group_id),
                &key_id.to_string(),
                &fail_counter_key(key_id),
            )
            .await?;
        if promoted {
            counter!("key_promotions_total").increment(1);
            info!(key_id, group_id, "key promoted to active");
            self.db.api_keys().mark_active(key_id).await?;
        }
        Ok(promoted)
    }

    /// Register freshly imported keys. `plaintexts` maps key id to the
    /// decrypted value so the data cache is warm from the start.
    pub async fn add_keys(
        &self,
        keys: &[api_keys::Model],
        plaintexts: &HashMap<i32, String>,
    ) -> Result<(), AppError> {
        let mut active_by_group: HashMap<i32, Vec<String>> = HashMap::new();
        for model in keys {
            let value = match plaintexts.get(&model.id) {
                Some(v) => v.clone(),
                None => self
                    .crypto
                    .decrypt(&model.key_value)
                    .map_err(|e| AppError::Internal(format!("key {}: {e}", model.id)))?,
            };
            self.cache_key_data(model, &value).await?;
            if model.is_active() {
                active_by_group
                    .entry(model.group_id)
                    .or_default()
                    .push(model.id.to_string());
            } else {
                self.store
                    .set_add(&invalid_set_key(model.group_id), &model.id.to_string())
                    .await?;
            }
        }
        for (group_id, ids) in active_by_group {
            self.store.list_push(&active_list_key(group_id), &ids).await?;
        }
        Ok(())
    }

    /// Remove keys from the runtime state. Called inside the delete-group
    /// transaction: a KV failure here must roll the DB delete back, so
    /// errors propagate.
    pub async fn remove_keys(&self, group_id: i32, key_ids: &[i32]) -> Result<(), AppError> {
        let list_key = active_list_key(group_id);
        let set_key = invalid_set_key(group_id);
        for key_id in key_ids {
            let member = key_id.to_string();
            self.store.list_remove(&list_key, &member).await?;
            self.store.set_remove(&set_key, &member).await?;
            self.store.delete(&fail_counter_key(*key_id)).await?;
            self.store.delete(&key_data_key(*key_id)).await?;
        }
        Ok(())
    }

    /// Master cold start: rebuild every group's runtime state from the
    /// durable copy.
    pub async fn load_from_db(&self) -> Result<(), AppError> {
        let keys = self.db.api_keys().all().await?;

        let mut group_ids: Vec<i32> = keys.iter().map(|k| k.group_id).collect();
        group_ids.sort_unstable();
        group_ids.dedup();
        for group_id in &group_ids {
            self.store.delete(&active_list_key(*group_id)).await?;
            self.store.delete(&invalid_set_key(*group_id)).await?;
        }

        let total = keys.len();
        self.add_keys(&keys, &HashMap::new()).await?;
        info!(keys = total, groups = group_ids.len(), "key pool loaded from database");
        Ok(())
    }

    /// Invalid key ids per group, for the cron validator snapshot.
    pub async fn invalid_ids(&self, group_id: i32) -> Result<Vec<i32>, AppError> {
        let members = self.store.set_members(&invalid_set_key(group_id)).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    pub async fn active_len(&self, group_id: i32) -> Result<usize, AppError> {
        Ok(self.store.list_len(&active_list_key(group_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::database::entities::api_keys::KEY_STATUS_ACTIVE;
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set};

    async fn test_pool() -> (KeyPool, Arc<DatabaseManager>, EncryptionService) {
        let db = Arc::new(DatabaseManager::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();
        let crypto = EncryptionService::new("pool-test-secret");
        let pool = KeyPool::new(
            Arc::new(MemoryStore::new()),
            db.clone(),
            crypto.clone(),
            Duration::from_secs(3600),
        );
        (pool, db, crypto)
    }

    async fn seed_key(
        db: &DatabaseManager,
        crypto: &EncryptionService,
        group_id: i32,
        value: &str,
    ) -> api_keys::Model {
        api_keys::ActiveModel {
            group_id: Set(group_id),
            key_value: Set(crypto.encrypt(value).unwrap()),
            key_hash: Set(crate::crypto::hash_key(value)),
            status: Set(KEY_STATUS_ACTIVE.to_string()),
            failure_count: Set(0),
            last_used_at: Set(None),
            last_error: Set(None),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&db.connection)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_round_robin() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        let k2 = seed_key(&db, &crypto, 1, "sk-BBB").await;
        pool.add_keys(&[k1, k2], &HashMap::new()).await.unwrap();

        let a = pool.acquire(1).await.unwrap();
        let b = pool.acquire(1).await.unwrap();
        let c = pool.acquire(1).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
        assert_eq!(a.key_value, "sk-AAA");
    }

    #[tokio::test]
    async fn test_acquire_empty_pool() {
        let (pool, _db, _crypto) = test_pool().await;
        assert!(matches!(
            pool.acquire(9).await,
            Err(AppError::NoActiveKey(_))
        ));
    }

    #[tokio::test]
    async fn test_attributable_failures_demote_once() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        let k2 = seed_key(&db, &crypto, 1, "sk-BBB").await;
        pool.add_keys(&[k1.clone(), k2], &HashMap::new()).await.unwrap();

        let handle = KeyHandle {
            id: k1.id,
            group_id: 1,
            key_value: "sk-AAA".into(),
            key_hash: k1.key_hash.clone(),
        };
        for expect_demote in [false, false, true] {
            let demoted = pool
                .report_failure(&handle, FailureKind::KeyAttributable, 3, "401 unauthorized")
                .await
                .unwrap();
            assert_eq!(demoted, expect_demote);
        }

        // Membership moved and the durable copy followed.
        assert_eq!(pool.active_len(1).await.unwrap(), 1);
        assert_eq!(pool.invalid_ids(1).await.unwrap(), vec![k1.id]);
        let row = db.api_keys().find_by_id(k1.id).await.unwrap().unwrap();
        assert_eq!(row.status, "invalid");
        assert_eq!(row.last_error.as_deref(), Some("401 unauthorized"));

        // Subsequent failures are no-ops on status.
        let demoted = pool
            .report_failure(&handle, FailureKind::KeyAttributable, 3, "401")
            .await
            .unwrap();
        assert!(!demoted);

        // The surviving key is the only one acquirable.
        let next = pool.acquire(1).await.unwrap();
        assert_eq!(next.key_value, "sk-BBB");
    }

    #[tokio::test]
    async fn test_transient_failures_never_demote() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        pool.add_keys(&[k1.clone()], &HashMap::new()).await.unwrap();

        let handle = pool.acquire(1).await.unwrap();
        for _ in 0..10 {
            let demoted = pool
                .report_failure(&handle, FailureKind::Transient, 3, "502 bad gateway")
                .await
                .unwrap();
            assert!(!demoted);
        }
        assert_eq!(pool.active_len(1).await.unwrap(), 1);
        let row = db.api_keys().find_by_id(k1.id).await.unwrap().unwrap();
        assert_eq!(row.status, "active");
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        pool.add_keys(&[k1.clone()], &HashMap::new()).await.unwrap();
        let handle = pool.acquire(1).await.unwrap();

        for _ in 0..2 {
            pool.report_failure(&handle, FailureKind::KeyAttributable, 3, "401")
                .await
                .unwrap();
        }
        pool.report_success(&handle).await;

        // Two more failures: the window restarted, so still no demotion.
        for _ in 0..2 {
            let demoted = pool
                .report_failure(&handle, FailureKind::KeyAttributable, 3, "401")
                .await
                .unwrap();
            assert!(!demoted);
        }
        let row = db.api_keys().find_by_id(k1.id).await.unwrap().unwrap();
        assert!(row.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_promote_round_trip() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        pool.add_keys(&[k1.clone()], &HashMap::new()).await.unwrap();
        let handle = pool.acquire(1).await.unwrap();

        pool.report_failure(&handle, FailureKind::KeyAttributable, 1, "401")
            .await
            .unwrap();
        assert_eq!(pool.active_len(1).await.unwrap(), 0);

        assert!(pool.promote(1, k1.id).await.unwrap());
        assert_eq!(pool.active_len(1).await.unwrap(), 1);
        assert!(pool.invalid_ids(1).await.unwrap().is_empty());
        let row = db.api_keys().find_by_id(k1.id).await.unwrap().unwrap();
        assert_eq!(row.status, "active");
        assert_eq!(row.failure_count, 0);

        // Idempotent.
        assert!(!pool.promote(1, k1.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_keys_clears_runtime_state() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        pool.add_keys(&[k1.clone()], &HashMap::new()).await.unwrap();

        pool.remove_keys(1, &[k1.id]).await.unwrap();
        assert!(matches!(
            pool.acquire(1).await,
            Err(AppError::NoActiveKey(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_db_rebuilds_membership() {
        let (pool, db, crypto) = test_pool().await;
        let k1 = seed_key(&db, &crypto, 1, "sk-AAA").await;
        let _k2 = seed_key(&db, &crypto, 2, "sk-BBB").await;
        db.api_keys().mark_invalid(k1.id, 3, "401").await.unwrap();

        pool.load_from_db().await.unwrap();
        assert_eq!(pool.active_len(1).await.unwrap(), 0);
        assert_eq!(pool.invalid_ids(1).await.unwrap(), vec![k1.id]);
        assert_eq!(pool.active_len(2).await.unwrap(), 1);
    }
}
