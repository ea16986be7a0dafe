//! Port Allocation Service
//!
//! Hands every probe MAC exactly one proxy port, forever (until archived).
//! All creating attempts in this process go through one mutex; the registry
//! transaction and unique indexes cover writers in other processes.

use probegate_proto::{
    DeviceStatus, MacAddress, PortOrigin, RequestPortResponse, DEFAULT_BASE_PORT,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{authorized_key_line, CredentialStore};
use crate::error::{AllocationError, RegistryError};
use crate::registry::{AllocationOutcome, Device, DeviceRegistry, PortRange, Registration};

/// Attempts before a run of registry conflicts is reported as unavailability
const DEFAULT_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default)]
    pub max_port: Option<u16>,
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_conflict_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            max_port: None,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

impl AllocatorConfig {
    fn range(&self) -> PortRange {
        PortRange {
            base: self.base_port,
            max: self.max_port,
        }
    }
}

/// A MAC's port and whether it was just created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub mac: MacAddress,
    pub port: u16,
    pub origin: PortOrigin,
    pub device_name: String,
}

impl PortAssignment {
    fn from_device(device: Device, origin: PortOrigin) -> Self {
        Self {
            mac: device.mac,
            port: device.port,
            origin,
            device_name: device.name,
        }
    }

    pub fn to_response(&self) -> RequestPortResponse {
        RequestPortResponse {
            port: self.port,
            status: self.origin,
            mac: self.mac,
            device_name: self.device_name.clone(),
        }
    }
}

pub struct PortAllocationService {
    registry: Arc<dyn DeviceRegistry>,
    config: AllocatorConfig,
    allocation_lock: Mutex<()>,
}

impl PortAllocationService {
    pub fn new(registry: Arc<dyn DeviceRegistry>, config: AllocatorConfig) -> Self {
        Self {
            registry,
            config,
            allocation_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Return the MAC's port, creating a `Pending` record on first contact
    pub async fn request_port(&self, mac: &MacAddress) -> Result<PortAssignment, AllocationError> {
        if let Some(device) = self.registry.find_by_mac(mac).await? {
            debug!(mac = %mac, port = device.port, "Returning existing port");
            return Ok(PortAssignment::from_device(device, PortOrigin::Existing));
        }

        let _guard = self.allocation_lock.lock().await;
        let range = self.config.range();
        let attempts = self.config.conflict_retries.max(1);

        for attempt in 1..=attempts {
            match self.registry.allocate(mac, range).await {
                Ok(AllocationOutcome::Existing(device)) => {
                    return Ok(PortAssignment::from_device(device, PortOrigin::Existing));
                }
                Ok(AllocationOutcome::Created(device)) => {
                    info!(mac = %mac, port = device.port, name = %device.name, "Allocated new port");
                    return Ok(PortAssignment::from_device(device, PortOrigin::New));
                }
                Ok(AllocationOutcome::Exhausted) => {
                    warn!(mac = %mac, base = range.base, max = range.upper(), "Port range exhausted");
                    return Err(AllocationError::Exhausted {
                        base: range.base,
                        max: range.upper(),
                    });
                }
                Err(RegistryError::Conflict(detail)) => {
                    warn!(mac = %mac, attempt, %detail, "Allocation conflicted with another writer");
                    // Another writer may have created this MAC; otherwise it took our port
                    if let Some(device) = self.registry.find_by_mac(mac).await? {
                        return Ok(PortAssignment::from_device(device, PortOrigin::Existing));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AllocationError::BackingStoreUnavailable(format!(
            "allocation for {} still conflicting after {} attempts",
            mac, attempts
        )))
    }

    /// Record the registration trigger's acknowledgement and activate the device
    pub async fn register(
        &self,
        mac: &MacAddress,
        registration: Registration,
    ) -> Result<Device, AllocationError> {
        let device = self.registry.register(mac, registration).await?;

        if device.status == DeviceStatus::Decommissioned {
            return Err(AllocationError::Decommissioned(mac.to_string()));
        }

        info!(mac = %mac, tenant = ?device.tenant, port = device.port, "Device registered");
        Ok(device)
    }

    /// Install the probe's key, then register it.
    ///
    /// The key is checked before anything is written, and a key that went in
    /// is taken out again if the registry update fails, so a failed call
    /// leaves the device as it was.
    pub async fn enroll(
        &self,
        mac: &MacAddress,
        registration: Registration,
        credentials: &dyn CredentialStore,
    ) -> Result<Device, AllocationError> {
        let Some(key) = registration.public_key.clone() else {
            return self.register(mac, registration).await;
        };

        let device = self
            .registry
            .find_by_mac(mac)
            .await?
            .ok_or_else(|| AllocationError::NotFound(mac.to_string()))?;
        if device.status == DeviceStatus::Decommissioned {
            return Err(AllocationError::Decommissioned(mac.to_string()));
        }

        authorized_key_line(&key, device.port, &device.name)?;
        let installed = credentials.install(&device.name, device.port, &key).await?;

        match self.register(mac, registration).await {
            Ok(device) => Ok(device),
            Err(e) => {
                if installed {
                    if let Err(rollback) = credentials.revoke(&device.name).await {
                        warn!(mac = %mac, "Failed to remove key after registration error: {}", rollback);
                    }
                }
                Err(e)
            }
        }
    }

    /// Whether the backing registry is reachable
    pub async fn health(&self) -> bool {
        match self.registry.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Registry health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceFilter, LivenessUpdate, SeaOrmRegistry};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    async fn sqlite_registry() -> SeaOrmRegistry {
        let db = probegate_registry_db::connect("sqlite::memory:").await.unwrap();
        probegate_registry_db::migrate(&db).await.unwrap();
        SeaOrmRegistry::new(db)
    }

    /// Simulates another process writing between our read and our insert
    struct RacingRegistry {
        inner: SeaOrmRegistry,
        rival: MacAddress,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl DeviceRegistry for RacingRegistry {
        async fn ping(&self) -> Result<(), RegistryError> {
            self.inner.ping().await
        }
        async fn find_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, RegistryError> {
            self.inner.find_by_mac(mac).await
        }
        async fn find_by_port(&self, port: u16) -> Result<Option<Device>, RegistryError> {
            self.inner.find_by_port(port).await
        }
        async fn list(&self, filter: &DeviceFilter) -> Result<Vec<Device>, RegistryError> {
            self.inner.list(filter).await
        }
        async fn list_monitored(&self) -> Result<Vec<Device>, RegistryError> {
            self.inner.list_monitored().await
        }
        async fn allocate(&self, mac: &MacAddress, range: PortRange) -> Result<AllocationOutcome, RegistryError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                self.inner.allocate(&self.rival, range).await?;
                return Err(RegistryError::Conflict("device.port".into()));
            }
            self.inner.allocate(mac, range).await
        }
        async fn register(&self, mac: &MacAddress, registration: Registration) -> Result<Device, RegistryError> {
            self.inner.register(mac, registration).await
        }
        async fn apply_liveness(&self, id: Uuid, update: LivenessUpdate) -> Result<Option<Device>, RegistryError> {
            self.inner.apply_liveness(id, update).await
        }
        async fn decommission(&self, id: Uuid) -> Result<bool, RegistryError> {
            self.inner.decommission(id).await
        }
        async fn list_archivable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>, RegistryError> {
            self.inner.list_archivable(cutoff).await
        }
        async fn archive(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<bool, RegistryError> {
            self.inner.archive(id, cutoff).await
        }
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_port_conflict_is_retried() {
        let registry = RacingRegistry {
            inner: sqlite_registry().await,
            rival: mac("11:11:11:11:11:11"),
            conflicts: AtomicU32::new(1),
        };
        let service = PortAllocationService::new(Arc::new(registry), AllocatorConfig::default());

        let assignment = service.request_port(&mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
        assert_eq!(assignment.origin, PortOrigin::New);
        assert_eq!(assignment.port, 10002);
    }

    #[tokio::test]
    async fn test_same_mac_conflict_returns_winner() {
        let target = mac("aa:bb:cc:dd:ee:ff");
        let registry = RacingRegistry {
            inner: sqlite_registry().await,
            rival: target,
            conflicts: AtomicU32::new(1),
        };
        let service = PortAllocationService::new(Arc::new(registry), AllocatorConfig::default());

        let assignment = service.request_port(&target).await.unwrap();
        assert_eq!(assignment.origin, PortOrigin::Existing);
        assert_eq!(assignment.port, 10001);
    }

    #[tokio::test]
    async fn test_persistent_conflicts_are_bounded() {
        let registry = RacingRegistry {
            inner: sqlite_registry().await,
            rival: mac("11:11:11:11:11:11"),
            conflicts: AtomicU32::new(100),
        };
        let config = AllocatorConfig {
            conflict_retries: 3,
            ..Default::default()
        };
        let service = PortAllocationService::new(Arc::new(registry), config);

        let err = service.request_port(&mac("aa:bb:cc:dd:ee:ff")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let config = AllocatorConfig {
            base_port: 20000,
            max_port: Some(20000),
            ..Default::default()
        };
        let service = PortAllocationService::new(Arc::new(sqlite_registry().await), config);

        service.request_port(&mac("00:00:00:00:00:01")).await.unwrap();
        let err = service.request_port(&mac("00:00:00:00:00:02")).await.unwrap_err();
        assert!(matches!(err, AllocationError::Exhausted { base: 20000, max: 20000 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_register_unknown_mac() {
        let service = PortAllocationService::new(Arc::new(sqlite_registry().await), AllocatorConfig::default());
        let err = service
            .register(
                &mac("00:00:00:00:00:01"),
                Registration {
                    tenant: "acme".into(),
                    site: None,
                    public_key: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::NotFound(_)));
    }
}
