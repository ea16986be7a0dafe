//! Initial schema: the device table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Device::Table)
                    .if_not_exists()
                    .col(uuid(Device::Id).primary_key())
                    .col(string_len(Device::Mac, 17).not_null().unique_key())
                    .col(string_len(Device::Name, 64).not_null())
                    .col(string_len_null(Device::Tenant, 255))
                    .col(string_len_null(Device::Site, 255))
                    .col(integer(Device::Port).not_null().unique_key())
                    .col(string_len(Device::Status, 32).not_null().default("pending"))
                    .col(text_null(Device::PublicKey))
                    .col(timestamp_with_time_zone_null(Device::RegisteredAt))
                    .col(timestamp_with_time_zone_null(Device::LastHeartbeat))
                    .col(integer(Device::ConsecutiveFailures).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Device::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Device::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_tenant")
                    .table(Device::Table)
                    .col(Device::Tenant)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_status")
                    .table(Device::Table)
                    .col(Device::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Device::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Device {
    Table,
    Id,
    Mac,
    Name,
    Tenant,
    Site,
    Port,
    Status,
    PublicKey,
    RegisteredAt,
    LastHeartbeat,
    ConsecutiveFailures,
    CreatedAt,
    UpdatedAt,
}
