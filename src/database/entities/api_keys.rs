use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const KEY_STATUS_ACTIVE: &str = "active";
pub const KEY_STATUS_INVALID: &str = "invalid";

/// A provider API key owned by exactly one group. `key_value` is encrypted
/// at rest; `key_hash` is the deterministic fingerprint used for dedup and
/// log lookups. `(group_id, key_hash)` is unique.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub group_id: i32,
    #[sea_orm(column_type = "Text")]
    pub key_value: String,
    pub key_hash: String,
    pub status: String,
    pub failure_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == KEY_STATUS_ACTIVE
    }
}
