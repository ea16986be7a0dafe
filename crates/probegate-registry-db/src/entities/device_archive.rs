//! Archived devices, removed from the active working set by cleanup

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::device::DeviceStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_archive")]
pub struct Model {
    /// Same id the device had in the working set
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub mac: String,

    pub name: String,

    pub tenant: Option<String>,

    /// Port released by archiving
    pub port: i32,

    /// Status at the time of archiving
    pub final_status: DeviceStatus,

    pub registered_at: Option<ChronoDateTimeUtc>,

    pub archived_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
