use super::RequestLogs;
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RequestLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RequestLogs::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RequestLogs::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RequestLogs::GroupId).integer().not_null())
                    .col(ColumnDef::new(RequestLogs::GroupName).string().not_null())
                    .col(ColumnDef::new(RequestLogs::UpstreamUrl).string().not_null())
                    .col(ColumnDef::new(RequestLogs::KeyHash).string().not_null())
                    .col(ColumnDef::new(RequestLogs::KeyValue).text().not_null())
                    .col(ColumnDef::new(RequestLogs::Model).string().not_null())
                    .col(ColumnDef::new(RequestLogs::StatusCode).integer().not_null())
                    .col(
                        ColumnDef::new(RequestLogs::DurationMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RequestLogs::IsStream).boolean().not_null())
                    .col(ColumnDef::new(RequestLogs::Retries).integer().not_null())
                    .col(ColumnDef::new(RequestLogs::ErrorMessage).text().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_request_logs_timestamp")
                    .table(RequestLogs::Table)
                    .col(RequestLogs::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_request_logs_group_name_timestamp")
                    .table(RequestLogs::Table)
                    .col(RequestLogs::GroupName)
                    .col(RequestLogs::Timestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_request_logs_key_hash")
                    .table(RequestLogs::Table)
                    .col(RequestLogs::KeyHash)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RequestLogs::Table).to_owned())
            .await
    }
}
