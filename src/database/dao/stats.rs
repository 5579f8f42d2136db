use crate::database::entities::{group_hourly_stats, group_monthly_stats};
use crate::database::{DatabaseError, DatabaseResult, is_unique_violation};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, sea_query::Expr,
};

/// Truncate to the containing hour.
pub fn hour_bucket(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// First instant of the containing month.
pub fn month_bucket(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// First instant of the month after `t`.
pub fn next_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Usage-counter DAO. Increments are additive upserts: an in-place additive
/// UPDATE first, then an INSERT of the delta row, retrying the UPDATE when a
/// concurrent writer wins the insert race.
pub struct StatsDao {
    db: DatabaseConnection,
}

impl StatsDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn hourly(
        &self,
        group_id: i32,
        hour: DateTime<Utc>,
    ) -> DatabaseResult<Option<group_hourly_stats::Model>> {
        Ok(group_hourly_stats::Entity::find()
            .filter(group_hourly_stats::Column::GroupId.eq(group_id))
            .filter(group_hourly_stats::Column::Time.eq(hour))
            .one(&self.db)
            .await?)
    }

    pub async fn monthly(
        &self,
        group_id: i32,
        month: DateTime<Utc>,
    ) -> DatabaseResult<Option<group_monthly_stats::Model>> {
        Ok(group_monthly_stats::Entity::find()
            .filter(group_monthly_stats::Column::GroupId.eq(group_id))
            .filter(group_monthly_stats::Column::Month.eq(month))
            .one(&self.db)
            .await?)
    }

    pub async fn add_hourly(
        &self,
        group_id: i32,
        hour: DateTime<Utc>,
        success: i64,
        failure: i64,
    ) -> DatabaseResult<()> {
        for _ in 0..3 {
            let res = group_hourly_stats::Entity::update_many()
                .col_expr(
                    group_hourly_stats::Column::SuccessCount,
                    Expr::col(group_hourly_stats::Column::SuccessCount).add(success),
                )
                .col_expr(
                    group_hourly_stats::Column::FailureCount,
                    Expr::col(group_hourly_stats::Column::FailureCount).add(failure),
                )
                .filter(group_hourly_stats::Column::GroupId.eq(group_id))
                .filter(group_hourly_stats::Column::Time.eq(hour))
                .exec(&self.db)
                .await?;
            if res.rows_affected > 0 {
                return Ok(());
            }

            let row = group_hourly_stats::ActiveModel {
                group_id: Set(group_id),
                time: Set(hour),
                success_count: Set(success),
                failure_count: Set(failure),
                ..Default::default()
            };
            match row.insert(&self.db).await {
                Ok(_) => return Ok(()),
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DatabaseError::Constraint(
            "hourly stat upsert retries exhausted".into(),
        ))
    }

    pub async fn add_monthly(
        &self,
        group_id: i32,
        month: DateTime<Utc>,
        requests: i64,
        success: i64,
        failure: i64,
    ) -> DatabaseResult<()> {
        for _ in 0..3 {
            let res = group_monthly_stats::Entity::update_many()
                .col_expr(
                    group_monthly_stats::Column::RequestCount,
                    Expr::col(group_monthly_stats::Column::RequestCount).add(requests),
                )
                .col_expr(
                    group_monthly_stats::Column::SuccessCount,
                    Expr::col(group_monthly_stats::Column::SuccessCount).add(success),
                )
                .col_expr(
                    group_monthly_stats::Column::FailureCount,
                    Expr::col(group_monthly_stats::Column::FailureCount).add(failure),
                )
                .filter(group_monthly_stats::Column::GroupId.eq(group_id))
                .filter(group_monthly_stats::Column::Month.eq(month))
                .exec(&self.db)
                .await?;
            if res.rows_affected > 0 {
                return Ok(());
            }

            let row = group_monthly_stats::ActiveModel {
                group_id: Set(group_id),
                month: Set(month),
                request_count: Set(requests),
                success_count: Set(success),
                failure_count: Set(failure),
                ..Default::default()
            };
            match row.insert(&self.db).await {
                Ok(_) => return Ok(()),
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DatabaseError::Constraint(
            "monthly stat upsert retries exhausted".into(),
        ))
    }

    /// Summed (success, failure) over hourly rows for a set of groups in
    /// `[from, to)`. Feeds the dashboard.
    pub async fn hourly_totals(
        &self,
        group_ids: &[i32],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DatabaseResult<(i64, i64)> {
        if group_ids.is_empty() {
            return Ok((0, 0));
        }
        let row: Option<(Option<i64>, Option<i64>)> = group_hourly_stats::Entity::find()
            .select_only()
            .column_as(group_hourly_stats::Column::SuccessCount.sum(), "success")
            .column_as(group_hourly_stats::Column::FailureCount.sum(), "failure")
            .filter(group_hourly_stats::Column::GroupId.is_in(group_ids.to_vec()))
            .filter(group_hourly_stats::Column::Time.gte(from))
            .filter(group_hourly_stats::Column::Time.lt(to))
            .into_tuple()
            .one(&self.db)
            .await?;
        let (success, failure) = row.unwrap_or((None, None));
        Ok((success.unwrap_or(0), failure.unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_bucket() {
        let t = Utc.with_ymd_and_hms(2026, 3, 15, 13, 45, 59).unwrap();
        assert_eq!(
            hour_bucket(t),
            Utc.with_ymd_and_hms(2026, 3, 15, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_month_bucket_and_next() {
        let t = Utc.with_ymd_and_hms(2026, 12, 15, 13, 45, 59).unwrap();
        assert_eq!(
            month_bucket(t),
            Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            next_month(t),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );

        let t = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_month(t),
            Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
        );
    }
}
