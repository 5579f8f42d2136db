//! Per-group quota checks against the persisted usage counters.
//!
//! Order of evaluation: expiry, hourly quota, monthly quota. Denied
//! requests are never counted toward usage; a brief overshoot of one
//! in-flight log batch per group is tolerated by design.

use crate::database::DatabaseManager;
use crate::database::dao::{hour_bucket, month_bucket, next_month};
use crate::error::AppError;
use crate::group::GroupRoute;
use crate::settings::SystemSettingsManager;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const REASON_EXPIRED: &str = "expired";
pub const REASON_HOURLY: &str = "hourly_limit";
pub const REASON_MONTHLY: &str = "monthly_limit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: &'static str,
    pub reset_at: DateTime<Utc>,
    pub limit: i64,
    pub used: i64,
}

impl Denial {
    /// Seconds until the quota window resets, for the `Retry-After` header.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.reset_at - now).num_seconds().max(0)
    }
}

pub struct RateLimiter {
    db: Arc<DatabaseManager>,
    settings: Arc<SystemSettingsManager>,
}

impl RateLimiter {
    pub fn new(db: Arc<DatabaseManager>, settings: Arc<SystemSettingsManager>) -> Self {
        Self { db, settings }
    }

    /// `None` means the request may proceed.
    pub async fn check(&self, route: &GroupRoute) -> Result<Option<Denial>, AppError> {
        let effective = route.effective(&self.settings.snapshot());
        let now = Utc::now();

        if let Some(expires_at) = effective.expires_at {
            if now >= expires_at {
                return Ok(Some(Denial {
                    reason: REASON_EXPIRED,
                    reset_at: expires_at,
                    limit: 0,
                    used: 0,
                }));
            }
        }

        if effective.max_requests_per_hour > 0 {
            let hour = hour_bucket(now);
            let used = match self.db.stats().hourly(route.id(), hour).await? {
                Some(stat) => stat.success_count + stat.failure_count,
                None => 0,
            };
            if used >= effective.max_requests_per_hour {
                return Ok(Some(Denial {
                    reason: REASON_HOURLY,
                    reset_at: hour + Duration::hours(1),
                    limit: effective.max_requests_per_hour,
                    used,
                }));
            }
        }

        if effective.max_requests_per_month > 0 {
            let month = month_bucket(now);
            let used = match self.db.stats().monthly(route.id(), month).await? {
                Some(stat) => stat.request_count,
                None => 0,
            };
            if used >= effective.max_requests_per_month {
                return Ok(Some(Denial {
                    reason: REASON_MONTHLY,
                    reset_at: next_month(now),
                    limit: effective.max_requests_per_month,
                    used,
                }));
            }
        }

        Ok(None)
    }
}
