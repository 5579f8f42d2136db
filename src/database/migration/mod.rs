use sea_orm_migration::prelude::*;

mod m20260110_000001_create_groups_table;
mod m20260110_000002_create_group_sub_groups_table;
mod m20260110_000003_create_api_keys_table;
mod m20260110_000004_create_request_logs_table;
mod m20260110_000005_create_group_hourly_stats_table;
mod m20260110_000006_create_group_monthly_stats_table;
mod m20260110_000007_create_system_settings_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260110_000001_create_groups_table::Migration),
            Box::new(m20260110_000002_create_group_sub_groups_table::Migration),
            Box::new(m20260110_000003_create_api_keys_table::Migration),
            Box::new(m20260110_000004_create_request_logs_table::Migration),
            Box::new(m20260110_000005_create_group_hourly_stats_table::Migration),
            Box::new(m20260110_000006_create_group_monthly_stats_table::Migration),
            Box::new(m20260110_000007_create_system_settings_table::Migration),
        ]
    }
}

#[derive(DeriveIden)]
pub enum Groups {
    Table,
    Id,
    Name,
    DisplayName,
    Description,
    GroupType,
    ChannelType,
    Upstreams,
    TestModel,
    ValidationEndpoint,
    ParamOverrides,
    ModelRedirectRules,
    ModelRedirectStrict,
    HeaderRules,
    ProxyKeys,
    Config,
    Sort,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
pub enum GroupSubGroups {
    Table,
    Id,
    GroupId,
    SubGroupId,
    Weight,
}

#[derive(DeriveIden)]
pub enum ApiKeys {
    Table,
    Id,
    GroupId,
    KeyValue,
    KeyHash,
    Status,
    FailureCount,
    LastUsedAt,
    LastError,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum RequestLogs {
    Table,
    Id,
    Timestamp,
    GroupId,
    GroupName,
    UpstreamUrl,
    KeyHash,
    KeyValue,
    Model,
    StatusCode,
    DurationMs,
    IsStream,
    Retries,
    ErrorMessage,
}

#[derive(DeriveIden)]
pub enum GroupHourlyStats {
    Table,
    Id,
    GroupId,
    Time,
    SuccessCount,
    FailureCount,
}

#[derive(DeriveIden)]
pub enum GroupMonthlyStats {
    Table,
    Id,
    GroupId,
    Month,
    RequestCount,
    SuccessCount,
    FailureCount,
}

#[derive(DeriveIden)]
pub enum SystemSettings {
    Table,
    Key,
    Value,
    UpdatedAt,
}
