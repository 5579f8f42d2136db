use super::{Job, JobResult};
use crate::database::DatabaseManager;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

const DELETE_CHUNK: u64 = 500;

/// Deletes request logs older than the retention window, in chunks so the
/// table is never locked for long.
pub struct LogCleanupJob {
    db: Arc<DatabaseManager>,
    retention_days: u32,
}

impl LogCleanupJob {
    pub fn new(db: Arc<DatabaseManager>, retention_days: u32) -> Self {
        Self { db, retention_days }
    }
}

#[async_trait]
impl Job for LogCleanupJob {
    fn name(&self) -> &str {
        "log_cleanup"
    }

    async fn execute(&self) -> Result<JobResult, AppError> {
        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let deleted = self
            .db
            .request_logs()
            .delete_before(cutoff, DELETE_CHUNK)
            .await?;
        Ok(JobResult::success_with_count(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::entities::request_logs;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set};

    async fn seed_log(db: &DatabaseManager, age_days: i64) {
        request_logs::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            timestamp: Set(Utc::now() - Duration::days(age_days)),
            group_id: Set(1),
            group_name: Set("g1".into()),
            upstream_url: Set("https://u".into()),
            key_hash: Set("h".into()),
            key_value: Set(String::new()),
            model: Set("m".into()),
            status_code: Set(200),
            duration_ms: Set(5),
            is_stream: Set(false),
            retries: Set(0),
            error_message: Set(None),
        }
        .insert(&db.connection)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_expired() {
        let db = Arc::new(DatabaseManager::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();

        seed_log(&db, 40).await;
        seed_log(&db, 31).await;
        seed_log(&db, 1).await;

        let job = LogCleanupJob::new(db.clone(), 30);
        let result = job.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(result.items_processed, 2);

        let (_, remaining) = db
            .request_logs()
            .query(&crate::database::LogQuery {
                page: 1,
                page_size: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
