use super::{Job, JobResult};
use crate::channel::{ValidationOutcome, adapter_for, validate_key};
use crate::config::ValidationConfig;
use crate::crypto::EncryptionService;
use crate::database::DatabaseManager;
use crate::database::entities::api_keys::{KEY_STATUS_ACTIVE, KEY_STATUS_INVALID};
use crate::error::{AppError, FailureKind};
use crate::group::GroupManager;
use crate::pool::{KeyHandle, KeyPool};
use crate::settings::SystemSettingsManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Periodic revalidation of invalid keys, plus an optional probe of a
/// sample of active keys to catch silent revocation.
pub struct KeyValidationJob {
    db: Arc<DatabaseManager>,
    pool: Arc<KeyPool>,
    groups: Arc<GroupManager>,
    crypto: EncryptionService,
    client: reqwest::Client,
    config: ValidationConfig,
    settings: Arc<SystemSettingsManager>,
    /// Per-group timestamp of the last cycle that touched it, so groups with
    /// a larger `key_validation_interval_minutes` are skipped until due.
    last_cycle: Mutex<HashMap<i32, DateTime<Utc>>>,
}

impl KeyValidationJob {
    pub fn new(
        db: Arc<DatabaseManager>,
        pool: Arc<KeyPool>,
        groups: Arc<GroupManager>,
        crypto: EncryptionService,
        client: reqwest::Client,
        config: ValidationConfig,
        settings: Arc<SystemSettingsManager>,
    ) -> Self {
        Self {
            db,
            pool,
            groups,
            crypto,
            client,
            config,
            settings,
            last_cycle: Mutex::new(HashMap::new()),
        }
    }

    fn group_due(&self, group_id: i32, interval_minutes: u64, now: DateTime<Utc>) -> bool {
        if interval_minutes == 0 {
            return true;
        }
        let last = self.last_cycle.lock().unwrap().get(&group_id).copied();
        match last {
            Some(t) => (now - t).num_minutes() as u64 >= interval_minutes,
            None => true,
        }
    }

    fn mark_cycle(&self, group_id: i32, now: DateTime<Utc>) {
        self.last_cycle.lock().unwrap().insert(group_id, now);
    }
}

#[async_trait]
impl Job for KeyValidationJob {
    fn name(&self) -> &str {
        "key_validation"
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let now = Utc::now();
        let defaults = self.settings.snapshot();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut probed = 0u64;
        let mut promoted = 0u64;

        for model in self.groups.list().await? {
            if model.is_aggregate() {
                continue;
            }
            let route = match self.groups.get_by_id(model.id).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(group = %model.name, error = %e, "skipping group in validation cycle");
                    continue;
                }
            };
            let effective = route.effective(&defaults);
            if !self.group_due(model.id, effective.key_validation_interval_minutes, now) {
                continue;
            }
            self.mark_cycle(model.id, now);

            let Some(adapter) = adapter_for(&model.channel_type) else {
                warn!(group = %model.name, channel = %model.channel_type, "no adapter registered");
                continue;
            };
            let timeout = Duration::from_secs(
                effective
                    .key_validation_timeout_seconds
                    .unwrap_or(self.config.timeout_seconds)
                    .max(1),
            );

            // Pass 1: every invalid key gets another chance. A group may cap
            // its own probe concurrency below the global limit.
            let invalid = self
                .db
                .api_keys()
                .list_by_group_status(model.id, KEY_STATUS_INVALID)
                .await?;
            let group_semaphore = effective
                .key_validation_concurrency
                .map(|n| Arc::new(Semaphore::new(n.max(1))));

            let mut tasks: JoinSet<(i32, ValidationOutcome)> = JoinSet::new();
            for key in invalid {
                let value = match self.crypto.decrypt(&key.key_value) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(key_id = key.id, error = %e, "cannot decrypt key for validation");
                        continue;
                    }
                };
                let semaphore = semaphore.clone();
                let group_semaphore = group_semaphore.clone();
                let client = self.client.clone();
                let adapter = adapter.clone();
                let route = route.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let _group_permit = match group_semaphore {
                        Some(s) => s.acquire_owned().await.ok(),
                        None => None,
                    };
                    let outcome =
                        validate_key(&client, adapter.as_ref(), &route, &value, timeout).await;
                    (key.id, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let Ok((key_id, outcome)) = joined else {
                    continue;
                };
                probed += 1;
                match outcome {
                    ValidationOutcome::Ok => {
                        if self.pool.promote(model.id, key_id).await? {
                            promoted += 1;
                        }
                    }
                    ValidationOutcome::Permanent(reason) => {
                        if let Err(e) =
                            self.db.api_keys().update_last_error(key_id, &reason).await
                        {
                            warn!(key_id, error = %e, "failed to record validation error");
                        }
                    }
                    ValidationOutcome::Retryable(reason) => {
                        tracing::debug!(key_id, reason = %reason, "validation inconclusive");
                    }
                }
            }

            // Pass 2: sample active keys for silent revocation. A permanent
            // probe failure feeds normal threshold accounting.
            if self.config.active_sample_size > 0 {
                let mut active = self
                    .db
                    .api_keys()
                    .list_by_group_status(model.id, KEY_STATUS_ACTIVE)
                    .await?;
                active.shuffle(&mut rand::rng());
                active.truncate(self.config.active_sample_size);

                for key in active {
                    let Ok(value) = self.crypto.decrypt(&key.key_value) else {
                        continue;
                    };
                    let outcome =
                        validate_key(&self.client, adapter.as_ref(), &route, &value, timeout).await;
                    probed += 1;
                    if let ValidationOutcome::Permanent(reason) = outcome {
                        let handle = KeyHandle {
                            id: key.id,
                            group_id: key.group_id,
                            key_value: value,
                            key_hash: key.key_hash.clone(),
                        };
                        self.pool
                            .report_failure(
                                &handle,
                                FailureKind::KeyAttributable,
                                effective.blacklist_threshold,
                                &reason,
                            )
                            .await?;
                    }
                }
            }
        }

        info!(probed, promoted, "key validation cycle complete");
        Ok(JobResult::success_with_count(probed))
    }
}
