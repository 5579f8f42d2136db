use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per proxied request, appended by the log pipeline and pruned by
/// the retention job. The id doubles as the client-visible request id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: i32,
    pub group_name: String,
    pub upstream_url: String,
    pub key_hash: String,
    #[sea_orm(column_type = "Text")]
    pub key_value: String,
    pub model: String,
    pub status_code: i32,
    pub duration_ms: i64,
    pub is_stream: bool,
    pub retries: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}
