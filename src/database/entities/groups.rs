use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const GROUP_TYPE_STANDARD: &str = "standard";
pub const GROUP_TYPE_AGGREGATE: &str = "aggregate";

/// A tenant configuration. JSON columns hold the shapes parsed in
/// `crate::group::types`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub group_type: String,
    pub channel_type: String,
    pub upstreams: Json,
    pub test_model: String,
    pub validation_endpoint: String,
    pub param_overrides: Json,
    pub model_redirect_rules: Json,
    pub model_redirect_strict: bool,
    pub header_rules: Json,
    /// Newline/whitespace-separated client credentials. Never forwarded.
    #[sea_orm(column_type = "Text")]
    pub proxy_keys: String,
    pub config: Json,
    pub sort: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_aggregate(&self) -> bool {
        self.group_type == GROUP_TYPE_AGGREGATE
    }
}
