//! Lifecycle Controller
//!
//! Keeps the registry in step with reality after provisioning:
//! - heartbeat sweeps flip devices between `active` and `offline`
//! - the kill switch revokes credentials and stops tunnels
//! - cleanup archives long-dead devices, releasing their ports

mod cleanup;
mod heartbeat;
mod kill_switch;

pub use cleanup::CleanupReport;

use probegate_tunnel::TunnelControl;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::credentials::CredentialStore;
use crate::probe::Prober;
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Consecutive missed heartbeats before a device is marked offline
    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    /// Probes in flight at once during a sweep
    pub probe_concurrency: usize,
    /// Devices revoked concurrently per kill switch batch
    pub kill_batch_size: usize,
    /// How long offline or decommissioned devices are kept before archiving
    #[serde(with = "secs")]
    pub retention: Duration,
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            heartbeat_interval: Duration::from_secs(60),
            probe_concurrency: 32,
            kill_batch_size: 50,
            retention: Duration::from_secs(30 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub struct LifecycleController {
    registry: Arc<dyn DeviceRegistry>,
    prober: Arc<dyn Prober>,
    tunnels: Arc<dyn TunnelControl>,
    credentials: Arc<dyn CredentialStore>,
    config: LifecycleConfig,
    // Overlapping sweeps would race on the failure counters
    sweep_lock: Mutex<()>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        prober: Arc<dyn Prober>,
        tunnels: Arc<dyn TunnelControl>,
        credentials: Arc<dyn CredentialStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            prober,
            tunnels,
            credentials,
            config,
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Sweep every `heartbeat_interval` until `shutdown` flips to true
    pub async fn run_heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.config.heartbeat_interval, "Heartbeat loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Heartbeat sweep failed: {}", e);
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Heartbeat loop stopped");
    }

    /// Archive every `cleanup_interval` until `shutdown` flips to true
    pub async fn run_cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.config.cleanup_interval, "Cleanup loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!("Cleanup pass failed: {}", e);
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Cleanup loop stopped");
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
