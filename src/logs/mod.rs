//! Buffered asynchronous request-log persistence.
//!
//! Producers (the proxy engine) enqueue records without ever blocking: the
//! queue is bounded and drops the oldest record on overflow. A single
//! consumer drains batches on a timer, inserts them in one statement and
//! rolls the per-group deltas into the hourly/monthly counters.

use crate::database::DatabaseManager;
use crate::database::dao::{hour_bucket, month_bucket};
use crate::database::entities::request_logs;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::ActiveValue::Set;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One proxied request, as handed to the pipeline by the proxy engine.
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: i32,
    pub group_name: String,
    pub upstream_url: String,
    pub key_hash: String,
    pub key_value_encrypted: String,
    pub model: String,
    pub status_code: i32,
    pub duration_ms: i64,
    pub is_stream: bool,
    pub retries: i32,
    pub error_message: Option<String>,
}

impl RequestLogRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    fn into_active_model(self) -> request_logs::ActiveModel {
        request_logs::ActiveModel {
            id: Set(self.id),
            timestamp: Set(self.timestamp),
            group_id: Set(self.group_id),
            group_name: Set(self.group_name),
            upstream_url: Set(self.upstream_url),
            key_hash: Set(self.key_hash),
            key_value: Set(self.key_value_encrypted),
            model: Set(self.model),
            status_code: Set(self.status_code),
            duration_ms: Set(self.duration_ms),
            is_stream: Set(self.is_stream),
            retries: Set(self.retries),
            error_message: Set(self.error_message),
        }
    }
}

pub struct RequestLogService {
    db: Arc<DatabaseManager>,
    queue: Mutex<VecDeque<RequestLogRecord>>,
    capacity: usize,
    batch_size: usize,
    flush_interval: Duration,
}

impl RequestLogService {
    pub fn new(db: Arc<DatabaseManager>, config: &crate::config::LogPipelineConfig) -> Self {
        Self {
            db,
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(4096))),
            capacity: config.queue_capacity.max(1),
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(10)),
        }
    }

    /// Enqueue a record. Never blocks the request path; the oldest record is
    /// dropped when the queue is full.
    pub fn record(&self, record: RequestLogRecord) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(record);
        while queue.len() > self.capacity {
            queue.pop_front();
            counter!("request_logs_dropped_total").increment(1);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn drain(&self, max: usize) -> Vec<RequestLogRecord> {
        let mut queue = self.queue.lock().unwrap();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    fn requeue_front(&self, records: Vec<RequestLogRecord>) {
        let mut queue = self.queue.lock().unwrap();
        for record in records.into_iter().rev() {
            if queue.len() >= self.capacity {
                counter!("request_logs_dropped_total").increment(1);
                continue;
            }
            queue.push_front(record);
        }
    }

    /// Drain one batch, insert it and roll the counters forward.
    /// Returns the number of records persisted.
    pub async fn flush_once(&self) -> Result<usize, AppError> {
        let batch = self.drain(self.batch_size);
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        // Per-bucket deltas are computed from each record's own timestamp so
        // batches straddling an hour boundary attribute correctly.
        let mut hourly: HashMap<(i32, DateTime<Utc>), (i64, i64)> = HashMap::new();
        let mut monthly: HashMap<(i32, DateTime<Utc>), (i64, i64, i64)> = HashMap::new();
        for record in &batch {
            let (success, failure) = if record.is_success() { (1, 0) } else { (0, 1) };
            let h = hourly
                .entry((record.group_id, hour_bucket(record.timestamp)))
                .or_default();
            h.0 += success;
            h.1 += failure;
            let m = monthly
                .entry((record.group_id, month_bucket(record.timestamp)))
                .or_default();
            m.0 += 1;
            m.1 += success;
            m.2 += failure;
        }

        let models: Vec<request_logs::ActiveModel> = batch
            .iter()
            .cloned()
            .map(RequestLogRecord::into_active_model)
            .collect();
        if let Err(e) = self.db.request_logs().insert_batch(models).await {
            // Push the batch back and let the next tick retry.
            self.requeue_front(batch);
            return Err(e.into());
        }

        for ((group_id, hour), (success, failure)) in hourly {
            self.db
                .stats()
                .add_hourly(group_id, hour, success, failure)
                .await?;
        }
        for ((group_id, month), (requests, success, failure)) in monthly {
            self.db
                .stats()
                .add_monthly(group_id, month, requests, success, failure)
                .await?;
        }

        debug!(count, "request log batch persisted");
        Ok(count)
    }

    /// Run the consumer until shutdown, then drain whatever remains.
    pub fn start(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        loop {
                            match self.flush_once().await {
                                Ok(n) if n >= self.batch_size => continue,
                                Ok(_) => break,
                                Err(e) => {
                                    error!(error = %e, "request log flush failed");
                                    break;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            // Final drain within the shutdown budget.
            while self.queue_len() > 0 {
                match self.flush_once().await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "request log final flush failed");
                        break;
                    }
                }
            }
            info!("request log pipeline stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogPipelineConfig;

    fn record(group_id: i32, status: i32) -> RequestLogRecord {
        RequestLogRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            group_id,
            group_name: format!("g{group_id}"),
            upstream_url: "https://u".into(),
            key_hash: "hash".into(),
            key_value_encrypted: String::new(),
            model: "gpt-4o".into(),
            status_code: status,
            duration_ms: 12,
            is_stream: false,
            retries: 0,
            error_message: None,
        }
    }

    async fn service(capacity: usize, batch: usize) -> (Arc<RequestLogService>, Arc<DatabaseManager>) {
        let db = Arc::new(DatabaseManager::connect("sqlite::memory:").await.unwrap());
        db.migrate().await.unwrap();
        let svc = Arc::new(RequestLogService::new(
            db.clone(),
            &LogPipelineConfig {
                queue_capacity: capacity,
                batch_size: batch,
                flush_interval_ms: 50,
                retention_days: 30,
                cleanup_interval_hours: 24,
            },
        ));
        (svc, db)
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let (svc, _db) = service(3, 10).await;
        for i in 0..5 {
            svc.record(record(i, 200));
        }
        assert_eq!(svc.queue_len(), 3);
        let drained = svc.drain(10);
        // The two oldest records (groups 0 and 1) were dropped.
        let groups: Vec<i32> = drained.iter().map(|r| r.group_id).collect();
        assert_eq!(groups, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_flush_inserts_and_rolls_up() {
        let (svc, db) = service(100, 50).await;
        for _ in 0..3 {
            svc.record(record(1, 200));
        }
        svc.record(record(1, 502));
        svc.record(record(2, 200));

        let flushed = svc.flush_once().await.unwrap();
        assert_eq!(flushed, 5);
        assert_eq!(svc.queue_len(), 0);

        let hour = hour_bucket(Utc::now());
        let g1 = db.stats().hourly(1, hour).await.unwrap().unwrap();
        assert_eq!(g1.success_count, 3);
        assert_eq!(g1.failure_count, 1);
        let g2 = db.stats().hourly(2, hour).await.unwrap().unwrap();
        assert_eq!(g2.success_count, 1);
        assert_eq!(g2.failure_count, 0);

        let month = month_bucket(Utc::now());
        let m1 = db.stats().monthly(1, month).await.unwrap().unwrap();
        assert_eq!(m1.request_count, 4);
        assert_eq!(m1.success_count + m1.failure_count, m1.request_count);

        let (rows, total) = db
            .request_logs()
            .query(&crate::database::LogQuery {
                page: 1,
                page_size: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_flush_batches_additively() {
        let (svc, db) = service(100, 2).await;
        for _ in 0..4 {
            svc.record(record(1, 200));
        }
        // Two batches of two.
        assert_eq!(svc.flush_once().await.unwrap(), 2);
        assert_eq!(svc.flush_once().await.unwrap(), 2);

        let hour = hour_bucket(Utc::now());
        let stat = db.stats().hourly(1, hour).await.unwrap().unwrap();
        assert_eq!(stat.success_count, 4);
    }

    #[tokio::test]
    async fn test_flush_empty_queue() {
        let (svc, _db) = service(10, 10).await;
        assert_eq!(svc.flush_once().await.unwrap(), 0);
    }
}
