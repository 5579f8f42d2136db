use crate::database::DatabaseResult;
use crate::database::entities::request_logs;
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, sea_query::Expr,
};

/// Filters for the admin log query.
#[derive(Debug, Default, Clone)]
pub struct LogQuery {
    /// Substring match on the group name; `%`/`_` in the input are escaped.
    pub group_name: Option<String>,
    pub key_hash: Option<String>,
    pub status_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page: u64,
    pub page_size: u64,
}

/// Escape LIKE wildcards so user input only ever matches literally.
fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub struct RequestLogsDao {
    db: DatabaseConnection,
}

impl RequestLogsDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert_batch(&self, batch: Vec<request_logs::ActiveModel>) -> DatabaseResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        request_logs::Entity::insert_many(batch)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn query(
        &self,
        query: &LogQuery,
    ) -> DatabaseResult<(Vec<request_logs::Model>, u64)> {
        let mut select = request_logs::Entity::find();

        if let Some(ref name) = query.group_name {
            let pattern = format!("%{}%", escape_like(name));
            select = select.filter(Expr::cust_with_values(
                r"group_name LIKE ? ESCAPE '\'",
                [pattern],
            ));
        }
        if let Some(ref hash) = query.key_hash {
            select = select.filter(request_logs::Column::KeyHash.eq(hash));
        }
        if let Some(status) = query.status_code {
            select = select.filter(request_logs::Column::StatusCode.eq(status));
        }
        if let Some(start) = query.start_time {
            select = select.filter(request_logs::Column::Timestamp.gte(start));
        }
        if let Some(end) = query.end_time {
            select = select.filter(request_logs::Column::Timestamp.lte(end));
        }

        let total = select.clone().count(&self.db).await?;

        let page_size = query.page_size.clamp(1, 500);
        let page = query.page.max(1);
        let rows = select
            .order_by_desc(request_logs::Column::Timestamp)
            .offset((page - 1) * page_size)
            .limit(page_size)
            .all(&self.db)
            .await?;

        Ok((rows, total))
    }

    /// Delete logs older than `cutoff` in id chunks to avoid long locks.
    pub async fn delete_before(&self, cutoff: DateTime<Utc>, chunk: u64) -> DatabaseResult<u64> {
        let mut deleted = 0u64;
        loop {
            let ids: Vec<String> = request_logs::Entity::find()
                .filter(request_logs::Column::Timestamp.lt(cutoff))
                .select_only()
                .column(request_logs::Column::Id)
                .limit(chunk)
                .into_tuple()
                .all(&self.db)
                .await?;
            if ids.is_empty() {
                break;
            }
            let res = request_logs::Entity::delete_many()
                .filter(request_logs::Column::Id.is_in(ids))
                .exec(&self.db)
                .await?;
            deleted += res.rows_affected;
            if res.rows_affected < chunk {
                break;
            }
        }
        Ok(deleted)
    }
}
