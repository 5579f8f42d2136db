use super::Groups;
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Groups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Groups::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Groups::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Groups::DisplayName)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Groups::Description)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Groups::GroupType).string().not_null())
                    .col(ColumnDef::new(Groups::ChannelType).string().not_null())
                    .col(ColumnDef::new(Groups::Upstreams).json().not_null())
                    .col(ColumnDef::new(Groups::TestModel).string().not_null())
                    .col(
                        ColumnDef::new(Groups::ValidationEndpoint)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Groups::ParamOverrides).json().not_null())
                    .col(ColumnDef::new(Groups::ModelRedirectRules).json().not_null())
                    .col(
                        ColumnDef::new(Groups::ModelRedirectStrict)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Groups::HeaderRules).json().not_null())
                    .col(
                        ColumnDef::new(Groups::ProxyKeys)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Groups::Config).json().not_null())
                    .col(ColumnDef::new(Groups::Sort).integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Groups::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Groups::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Groups::Table).to_owned())
            .await
    }
}
