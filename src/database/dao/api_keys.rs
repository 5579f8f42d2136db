use crate::database::entities::api_keys::{self, KEY_STATUS_ACTIVE, KEY_STATUS_INVALID};
use crate::database::DatabaseResult;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter,
};
use std::collections::HashSet;

/// Provider-key DAO. The key pool owns the runtime membership; this DAO owns
/// the durable copy.
pub struct ApiKeysDao {
    db: DatabaseConnection,
}

impl ApiKeysDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn all(&self) -> DatabaseResult<Vec<api_keys::Model>> {
        Ok(api_keys::Entity::find().all(&self.db).await?)
    }

    pub async fn list_by_group(&self, group_id: i32) -> DatabaseResult<Vec<api_keys::Model>> {
        Ok(api_keys::Entity::find()
            .filter(api_keys::Column::GroupId.eq(group_id))
            .all(&self.db)
            .await?)
    }

    pub async fn list_by_group_status(
        &self,
        group_id: i32,
        status: &str,
    ) -> DatabaseResult<Vec<api_keys::Model>> {
        Ok(api_keys::Entity::find()
            .filter(api_keys::Column::GroupId.eq(group_id))
            .filter(api_keys::Column::Status.eq(status))
            .all(&self.db)
            .await?)
    }

    pub async fn list_by_status(&self, status: &str) -> DatabaseResult<Vec<api_keys::Model>> {
        Ok(api_keys::Entity::find()
            .filter(api_keys::Column::Status.eq(status))
            .all(&self.db)
            .await?)
    }

    pub async fn find_by_id(&self, id: i32) -> DatabaseResult<Option<api_keys::Model>> {
        Ok(api_keys::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_by_ids(&self, ids: &[i32]) -> DatabaseResult<Vec<api_keys::Model>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(api_keys::Entity::find()
            .filter(api_keys::Column::Id.is_in(ids.to_vec()))
            .all(&self.db)
            .await?)
    }

    /// Insert new keys, skipping values whose fingerprint already exists in
    /// the group. Returns the inserted rows.
    pub async fn insert_keys(
        &self,
        group_id: i32,
        keys: &[(String, String)], // (encrypted value, hash)
    ) -> DatabaseResult<Vec<api_keys::Model>> {
        let existing: HashSet<String> = self
            .list_by_group(group_id)
            .await?
            .into_iter()
            .map(|k| k.key_hash)
            .collect();

        let mut inserted = Vec::new();
        let mut seen = HashSet::new();
        for (value, hash) in keys {
            if existing.contains(hash) || !seen.insert(hash.clone()) {
                continue;
            }
            let model = api_keys::ActiveModel {
                group_id: Set(group_id),
                key_value: Set(value.clone()),
                key_hash: Set(hash.clone()),
                status: Set(KEY_STATUS_ACTIVE.to_string()),
                failure_count: Set(0),
                last_used_at: Set(None),
                last_error: Set(None),
                created_at: Set(Utc::now()),
                ..Default::default()
            };
            inserted.push(model.insert(&self.db).await?);
        }
        Ok(inserted)
    }

    pub async fn delete_by_ids<C: ConnectionTrait>(conn: &C, ids: &[i32]) -> DatabaseResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let res = api_keys::Entity::delete_many()
            .filter(api_keys::Column::Id.is_in(ids.to_vec()))
            .exec(conn)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn mark_invalid(&self, id: i32, failure_count: i64, error: &str) -> DatabaseResult<()> {
        api_keys::Entity::update_many()
            .col_expr(
                api_keys::Column::Status,
                sea_orm::sea_query::Expr::value(KEY_STATUS_INVALID),
            )
            .col_expr(
                api_keys::Column::FailureCount,
                sea_orm::sea_query::Expr::value(failure_count),
            )
            .col_expr(
                api_keys::Column::LastError,
                sea_orm::sea_query::Expr::value(Some(error.to_string())),
            )
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_active(&self, id: i32) -> DatabaseResult<()> {
        api_keys::Entity::update_many()
            .col_expr(
                api_keys::Column::Status,
                sea_orm::sea_query::Expr::value(KEY_STATUS_ACTIVE),
            )
            .col_expr(
                api_keys::Column::FailureCount,
                sea_orm::sea_query::Expr::value(0i64),
            )
            .col_expr(
                api_keys::Column::LastError,
                sea_orm::sea_query::Expr::value(Option::<String>::None),
            )
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn record_success(&self, id: i32) -> DatabaseResult<()> {
        api_keys::Entity::update_many()
            .col_expr(
                api_keys::Column::FailureCount,
                sea_orm::sea_query::Expr::value(0i64),
            )
            .col_expr(
                api_keys::Column::LastUsedAt,
                sea_orm::sea_query::Expr::value(Some(Utc::now())),
            )
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn record_failure(&self, id: i32, failure_count: i64, error: &str) -> DatabaseResult<()> {
        api_keys::Entity::update_many()
            .col_expr(
                api_keys::Column::FailureCount,
                sea_orm::sea_query::Expr::value(failure_count),
            )
            .col_expr(
                api_keys::Column::LastError,
                sea_orm::sea_query::Expr::value(Some(error.to_string())),
            )
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_last_error(&self, id: i32, error: &str) -> DatabaseResult<()> {
        api_keys::Entity::update_many()
            .col_expr(
                api_keys::Column::LastError,
                sea_orm::sea_query::Expr::value(Some(error.to_string())),
            )
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// (total, active) counts for a group.
    pub async fn counts(&self, group_id: i32) -> DatabaseResult<(u64, u64)> {
        let total = api_keys::Entity::find()
            .filter(api_keys::Column::GroupId.eq(group_id))
            .count(&self.db)
            .await?;
        let active = api_keys::Entity::find()
            .filter(api_keys::Column::GroupId.eq(group_id))
            .filter(api_keys::Column::Status.eq(KEY_STATUS_ACTIVE))
            .count(&self.db)
            .await?;
        Ok((total, active))
    }
}
