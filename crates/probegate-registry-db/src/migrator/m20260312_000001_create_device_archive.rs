//! Archive table for devices removed from the working set by cleanup

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeviceArchive::Table)
                    .if_not_exists()
                    .col(uuid(DeviceArchive::Id).primary_key())
                    .col(string_len(DeviceArchive::Mac, 17).not_null())
                    .col(string_len(DeviceArchive::Name, 64).not_null())
                    .col(string_len_null(DeviceArchive::Tenant, 255))
                    .col(integer(DeviceArchive::Port).not_null())
                    .col(string_len(DeviceArchive::FinalStatus, 32).not_null())
                    .col(timestamp_with_time_zone_null(DeviceArchive::RegisteredAt))
                    .col(
                        timestamp_with_time_zone(DeviceArchive::ArchivedAt)
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
                    .name("idx_device_archive_mac")
                    .table(DeviceArchive::Table)
                    .col(DeviceArchive::Mac)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceArchive::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeviceArchive {
    Table,
    Id,
    Mac,
    Name,
    Tenant,
    Port,
    FinalStatus,
    RegisteredAt,
    ArchivedAt,
}
