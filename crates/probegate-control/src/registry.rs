//! Device registry: the system of record for probe state
//!
//! [`DeviceRegistry`] is the seam the allocator and the lifecycle controller
//! work against. [`SeaOrmRegistry`] stores devices in the `device` table and
//! moves archived rows to `device_archive`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use probegate_proto::{device_name, DeviceInfo, DeviceStatus, MacAddress};
use probegate_registry_db::entities::{device, device_archive};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::RegistryError;

/// A device in the active working set
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: Uuid,
    pub mac: MacAddress,
    pub name: String,
    pub tenant: Option<String>,
    pub site: Option<String>,
    pub port: u16,
    pub status: DeviceStatus,
    pub public_key: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn to_info(&self) -> DeviceInfo {
        DeviceInfo {
            mac: self.mac,
            name: self.name.clone(),
            tenant: self.tenant.clone(),
            site: self.site.clone(),
            port: self.port,
            status: self.status,
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

impl TryFrom<device::Model> for Device {
    type Error = RegistryError;

    fn try_from(model: device::Model) -> Result<Self, Self::Error> {
        let mac = model
            .mac
            .parse::<MacAddress>()
            .map_err(|e| RegistryError::InvalidRecord(format!("device {}: {}", model.id, e)))?;
        let port = u16::try_from(model.port).map_err(|_| {
            RegistryError::InvalidRecord(format!("device {}: port {} out of range", model.id, model.port))
        })?;

        Ok(Self {
            id: model.id,
            mac,
            name: model.name,
            tenant: model.tenant,
            site: model.site,
            port,
            status: model.status.into(),
            public_key: model.public_key,
            registered_at: model.registered_at,
            last_heartbeat: model.last_heartbeat,
            consecutive_failures: u32::try_from(model.consecutive_failures).unwrap_or(0),
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

/// Ports the allocator may hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: u16,
    pub max: Option<u16>,
}

impl PortRange {
    pub fn upper(&self) -> u16 {
        self.max.unwrap_or(u16::MAX)
    }
}

/// Result of an allocation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    /// The MAC already held a record
    Existing(Device),
    /// A `Pending` record was created
    Created(Device),
    /// Every port in the range is held
    Exhausted,
}

/// Filters for device listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub tenant: Option<String>,
    pub status: Option<DeviceStatus>,
}

/// Fields set when the automation controller acknowledges a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub tenant: String,
    pub site: Option<String>,
    pub public_key: Option<String>,
}

/// A liveness transition computed by the heartbeat sweep
///
/// Applied only if the device is still in `expected` status, so a sweep
/// never overwrites a concurrent kill switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessUpdate {
    pub expected: DeviceStatus,
    pub status: DeviceStatus,
    pub consecutive_failures: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Cheap reachability check
    async fn ping(&self) -> Result<(), RegistryError>;

    async fn find_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, RegistryError>;

    async fn find_by_port(&self, port: u16) -> Result<Option<Device>, RegistryError>;

    async fn list(&self, filter: &DeviceFilter) -> Result<Vec<Device>, RegistryError>;

    /// Devices the heartbeat sweep should probe (everything not decommissioned)
    async fn list_monitored(&self) -> Result<Vec<Device>, RegistryError>;

    /// Atomically return the MAC's record, or create a `Pending` one on the
    /// smallest free port in `range`.
    ///
    /// A unique-index violation from a concurrent writer is returned as
    /// [`RegistryError::Conflict`] with nothing written.
    async fn allocate(&self, mac: &MacAddress, range: PortRange) -> Result<AllocationOutcome, RegistryError>;

    /// Record a registration acknowledgement.
    ///
    /// Decommissioned devices are returned unchanged.
    async fn register(&self, mac: &MacAddress, registration: Registration) -> Result<Device, RegistryError>;

    /// Apply a heartbeat result; `None` when the device changed underneath
    async fn apply_liveness(&self, id: Uuid, update: LivenessUpdate) -> Result<Option<Device>, RegistryError>;

    /// Mark decommissioned; `false` when it already was
    async fn decommission(&self, id: Uuid) -> Result<bool, RegistryError>;

    /// Offline or decommissioned devices unchanged since `cutoff`
    async fn list_archivable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>, RegistryError>;

    /// Move one device to the archive, releasing its port.
    ///
    /// Rechecks eligibility inside the transaction; `false` if the device
    /// recovered or vanished meanwhile.
    async fn archive(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<bool, RegistryError>;
}

/// SeaORM-backed registry (PostgreSQL or SQLite)
#[derive(Debug, Clone)]
pub struct SeaOrmRegistry {
    db: DatabaseConnection,
}

impl SeaOrmRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

async fn find_model_by_mac<C: ConnectionTrait>(
    conn: &C,
    mac: &MacAddress,
) -> Result<Option<device::Model>, RegistryError> {
    Ok(device::Entity::find()
        .filter(device::Column::Mac.eq(mac.to_string()))
        .one(conn)
        .await?)
}

/// Smallest port in `range` not held by any row of the working set
async fn lowest_free_port<C: ConnectionTrait>(
    conn: &C,
    range: PortRange,
) -> Result<Option<u16>, RegistryError> {
    let held: Vec<i32> = device::Entity::find()
        .select_only()
        .column(device::Column::Port)
        .filter(device::Column::Port.gte(i32::from(range.base)))
        .order_by_asc(device::Column::Port)
        .into_tuple()
        .all(conn)
        .await?;

    let mut candidate = i32::from(range.base);
    for port in held {
        if port == candidate {
            candidate += 1;
        } else if port > candidate {
            break;
        }
    }

    if candidate > i32::from(range.upper()) {
        return Ok(None);
    }
    Ok(u16::try_from(candidate).ok())
}

fn into_devices(models: Vec<device::Model>) -> Result<Vec<Device>, RegistryError> {
    models.into_iter().map(Device::try_from).collect()
}

#[async_trait]
impl DeviceRegistry for SeaOrmRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        self.db.ping().await?;
        Ok(())
    }

    async fn find_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, RegistryError> {
        find_model_by_mac(&self.db, mac)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn find_by_port(&self, port: u16) -> Result<Option<Device>, RegistryError> {
        device::Entity::find()
            .filter(device::Column::Port.eq(i32::from(port)))
            .one(&self.db)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn list(&self, filter: &DeviceFilter) -> Result<Vec<Device>, RegistryError> {
        let mut query = device::Entity::find();
        if let Some(tenant) = &filter.tenant {
            query = query.filter(device::Column::Tenant.eq(tenant.as_str()));
        }
        if let Some(status) = filter.status {
            query = query.filter(device::Column::Status.eq(device::DeviceStatus::from(status)));
        }

        let models = query.order_by_asc(device::Column::Port).all(&self.db).await?;
        into_devices(models)
    }

    async fn list_monitored(&self) -> Result<Vec<Device>, RegistryError> {
        let models = device::Entity::find()
            .filter(device::Column::Status.ne(device::DeviceStatus::Decommissioned))
            .order_by_asc(device::Column::Port)
            .all(&self.db)
            .await?;
        into_devices(models)
    }

    async fn allocate(&self, mac: &MacAddress, range: PortRange) -> Result<AllocationOutcome, RegistryError> {
        let txn = self.db.begin().await?;

        if let Some(existing) = find_model_by_mac(&txn, mac).await? {
            txn.commit().await?;
            return Ok(AllocationOutcome::Existing(existing.try_into()?));
        }

        let Some(port) = lowest_free_port(&txn, range).await? else {
            txn.rollback().await?;
            return Ok(AllocationOutcome::Exhausted);
        };

        let now = Utc::now();
        let record = device::ActiveModel {
            id: Set(Uuid::new_v4()),
            mac: Set(mac.to_string()),
            name: Set(device_name(mac)),
            tenant: Set(None),
            site: Set(None),
            port: Set(i32::from(port)),
            status: Set(device::DeviceStatus::Pending),
            public_key: Set(None),
            registered_at: Set(None),
            last_heartbeat: Set(None),
            consecutive_failures: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };

        // Dropping the transaction on error rolls it back
        let created = record.insert(&txn).await?;
        txn.commit().await?;

        debug!(mac = %mac, port, "Inserted pending device");
        Ok(AllocationOutcome::Created(created.try_into()?))
    }

    async fn register(&self, mac: &MacAddress, registration: Registration) -> Result<Device, RegistryError> {
        let txn = self.db.begin().await?;

        let model = find_model_by_mac(&txn, mac)
            .await?
            .ok_or_else(|| RegistryError::NotFound(mac.to_string()))?;

        if model.status == device::DeviceStatus::Decommissioned {
            txn.commit().await?;
            return model.try_into();
        }

        let now = Utc::now();
        let status_changed = model.status != device::DeviceStatus::Active;
        let first_registration = model.registered_at.is_none();

        let mut record: device::ActiveModel = model.into();
        record.tenant = Set(Some(registration.tenant));
        if let Some(site) = registration.site {
            record.site = Set(Some(site));
        }
        if let Some(key) = registration.public_key {
            record.public_key = Set(Some(key));
        }
        if first_registration {
            record.registered_at = Set(Some(now));
        }
        record.status = Set(device::DeviceStatus::Active);
        record.consecutive_failures = Set(0);
        if status_changed {
            record.updated_at = Set(now);
        }

        let updated = record.update(&txn).await?;
        txn.commit().await?;
        updated.try_into()
    }

    async fn apply_liveness(&self, id: Uuid, update: LivenessUpdate) -> Result<Option<Device>, RegistryError> {
        let mut changes = device::ActiveModel {
            status: Set(update.status.into()),
            consecutive_failures: Set(i32::try_from(update.consecutive_failures).unwrap_or(i32::MAX)),
            ..Default::default()
        };
        if let Some(at) = update.last_heartbeat {
            changes.last_heartbeat = Set(Some(at));
        }
        if update.status != update.expected {
            changes.updated_at = Set(Utc::now());
        }

        let result = device::Entity::update_many()
            .set(changes)
            .filter(device::Column::Id.eq(id))
            .filter(device::Column::Status.eq(device::DeviceStatus::from(update.expected)))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }

        device::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn decommission(&self, id: Uuid) -> Result<bool, RegistryError> {
        let result = device::Entity::update_many()
            .set(device::ActiveModel {
                status: Set(device::DeviceStatus::Decommissioned),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(device::Column::Id.eq(id))
            .filter(device::Column::Status.ne(device::DeviceStatus::Decommissioned))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn list_archivable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>, RegistryError> {
        let models = device::Entity::find()
            .filter(device::Column::Status.is_in([
                device::DeviceStatus::Offline,
                device::DeviceStatus::Decommissioned,
            ]))
            .filter(device::Column::UpdatedAt.lt(cutoff))
            .order_by_asc(device::Column::Port)
            .all(&self.db)
            .await?;
        into_devices(models)
    }

    async fn archive(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<bool, RegistryError> {
        let txn = self.db.begin().await?;

        let Some(model) = device::Entity::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(false);
        };

        let status: DeviceStatus = model.status.into();
        if !status.is_archivable() || model.updated_at >= cutoff {
            txn.rollback().await?;
            return Ok(false);
        }

        device_archive::ActiveModel {
            id: Set(model.id),
            mac: Set(model.mac.clone()),
            name: Set(model.name.clone()),
            tenant: Set(model.tenant.clone()),
            port: Set(model.port),
            final_status: Set(model.status),
            registered_at: Set(model.registered_at),
            archived_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        device::Entity::delete_by_id(model.id).exec(&txn).await?;
        txn.commit().await?;

        debug!(mac = %model.mac, port = model.port, "Archived device");
        Ok(true)
    }
}
