//! Device entity: one row per probe in the active working set

use probegate_proto::DeviceStatus as ProtoStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status as stored in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum DeviceStatus {
    #[sea_orm(string_value = "pending")]
    Pending,

    #[sea_orm(string_value = "active")]
    Active,

    #[sea_orm(string_value = "offline")]
    Offline,

    #[sea_orm(string_value = "decommissioned")]
    Decommissioned,
}

impl From<DeviceStatus> for ProtoStatus {
    fn from(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Pending => ProtoStatus::Pending,
            DeviceStatus::Active => ProtoStatus::Active,
            DeviceStatus::Offline => ProtoStatus::Offline,
            DeviceStatus::Decommissioned => ProtoStatus::Decommissioned,
        }
    }
}

impl From<ProtoStatus> for DeviceStatus {
    fn from(status: ProtoStatus) -> Self {
        match status {
            ProtoStatus::Pending => DeviceStatus::Pending,
            ProtoStatus::Active => DeviceStatus::Active,
            ProtoStatus::Offline => DeviceStatus::Offline,
            ProtoStatus::Decommissioned => DeviceStatus::Decommissioned,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device")]
pub struct Model {
    /// Device UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Canonical MAC address (aa:bb:cc:dd:ee:ff)
    #[sea_orm(unique)]
    pub mac: String,

    /// Inventory name (probe-<mac hex>)
    pub name: String,

    /// Tenant, set when registration is acknowledged
    pub tenant: Option<String>,

    /// Site within the tenant
    pub site: Option<String>,

    /// Assigned proxy port, unique across the working set
    #[sea_orm(unique)]
    pub port: i32,

    pub status: DeviceStatus,

    /// Public key installed on the proxy
    #[sea_orm(column_type = "Text", nullable)]
    pub public_key: Option<String>,

    pub registered_at: Option<ChronoDateTimeUtc>,

    pub last_heartbeat: Option<ChronoDateTimeUtc>,

    pub consecutive_failures: i32,

    pub created_at: ChronoDateTimeUtc,

    /// Last status or attribute change; drives the cleanup retention window
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
