//! System-wide proxy defaults with database overrides.
//!
//! The base values come from the environment; rows in `system_settings`
//! override individual options at startup and on `reload()`. Components
//! read the current value through `snapshot()`, so a reload never tears an
//! in-flight request's view of the configuration.

use crate::config::ProxyDefaults;
use crate::database::DatabaseManager;
use crate::error::AppError;
use sea_orm::EntityTrait;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub struct SystemSettingsManager {
    db: Arc<DatabaseManager>,
    base: ProxyDefaults,
    snapshot: RwLock<Arc<ProxyDefaults>>,
}

impl SystemSettingsManager {
    pub fn new(db: Arc<DatabaseManager>, base: ProxyDefaults) -> Self {
        let snapshot = RwLock::new(Arc::new(base.clone()));
        Self { db, base, snapshot }
    }

    /// Immutable view of the current defaults.
    pub fn snapshot(&self) -> Arc<ProxyDefaults> {
        self.snapshot.read().unwrap().clone()
    }

    /// Merge `system_settings` rows over the environment base and swap the
    /// snapshot. Unknown keys and malformed values are skipped with a
    /// warning so one bad row cannot take the proxy down.
    pub async fn reload(&self) -> Result<(), AppError> {
        use crate::database::entities::system_settings;

        let rows = system_settings::Entity::find()
            .all(&self.db.connection)
            .await
            .map_err(crate::database::DatabaseError::from)?;

        let mut merged = serde_json::to_value(&self.base)
            .map_err(|e| AppError::Internal(format!("serialise defaults: {e}")))?;
        let Some(object) = merged.as_object_mut() else {
            return Err(AppError::Internal("defaults are not an object".into()));
        };

        let mut applied = 0usize;
        for row in rows {
            if !object.contains_key(&row.key) {
                warn!(key = %row.key, "ignoring unknown system setting");
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&row.value) {
                Ok(value) => {
                    object.insert(row.key, value);
                    applied += 1;
                }
                Err(e) => {
                    warn!(key = %row.key, error = %e, "ignoring malformed system setting");
                }
            }
        }

        match serde_json::from_value::<ProxyDefaults>(merged) {
            Ok(defaults) => {
                *self.snapshot.write().unwrap() = Arc::new(defaults);
                if applied > 0 {
                    info!(overrides = applied, "system settings loaded");
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "system settings rejected, keeping previous snapshot");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set};

    async fn manager_with_rows(rows: &[(&str, &str)]) -> SystemSettingsManager {
        let db = Arc::new(DatabaseManager::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();
        for (key, value) in rows {
            crate::database::entities::system_settings::ActiveModel {
                key: Set(key.to_string()),
                value: Set(value.to_string()),
                updated_at: Set(Utc::now()),
            }
            .insert(&db.connection)
            .await
            .unwrap();
        }
        SystemSettingsManager::new(db, Config::default().defaults)
    }

    #[tokio::test]
    async fn test_snapshot_starts_from_base() {
        let manager = manager_with_rows(&[]).await;
        assert_eq!(manager.snapshot().max_retries, 3);
    }

    #[tokio::test]
    async fn test_reload_applies_overrides() {
        let manager = manager_with_rows(&[("max_retries", "7"), ("blacklist_threshold", "5")]).await;
        manager.reload().await.unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.max_retries, 7);
        assert_eq!(snapshot.blacklist_threshold, 5);
        // Untouched options keep the environment value.
        assert_eq!(
            snapshot.upstream_timeout_seconds,
            Config::default().defaults.upstream_timeout_seconds
        );
    }

    #[tokio::test]
    async fn test_reload_skips_bad_rows() {
        let manager =
            manager_with_rows(&[("no_such_option", "1"), ("max_retries", "not json {{")]).await;
        manager.reload().await.unwrap();
        assert_eq!(manager.snapshot().max_retries, 3);
    }
}
