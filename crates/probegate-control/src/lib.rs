//! Provisioning and lifecycle control plane
//!
//! - [`PortAllocationService`]: race-free, idempotent port assignment per MAC
//! - [`LifecycleController`]: heartbeat sweeps, kill switch and cleanup
//! - [`DeviceRegistry`]: the system of record, backed by SeaORM

pub mod allocator;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod probe;
pub mod proxy_tunnel;
pub mod registry;

pub use allocator::{AllocatorConfig, PortAllocationService, PortAssignment};
pub use credentials::{authorized_key_line, AuthorizedKeysFile, CredentialStore};
pub use error::{AllocationError, CredentialError, KillSwitchError, ProbeError, RegistryError};
pub use lifecycle::{LifecycleConfig, LifecycleController};
pub use probe::{Prober, TcpProber};
pub use proxy_tunnel::{default_stop_command, ProxyTunnelControl};
pub use registry::{
    AllocationOutcome, Device, DeviceFilter, DeviceRegistry, LivenessUpdate, PortRange, Registration,
    SeaOrmRegistry,
};
