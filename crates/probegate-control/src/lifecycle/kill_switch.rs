//! Kill switch: revoke access for one device, one port or a whole tenant

use futures::stream::{self, StreamExt};
use probegate_proto::{DeviceFailure, DeviceStatus, KillReport, KillSelector};
use tracing::{info, warn};

use super::LifecycleController;
use crate::error::KillSwitchError;
use crate::registry::{Device, DeviceFilter};

enum RevokeOutcome {
    Revoked,
    AlreadyDecommissioned,
    Failed(String),
}

impl LifecycleController {
    /// Devices a selector refers to; unknown selectors match nothing
    pub async fn resolve(&self, selector: &KillSelector) -> Result<Vec<Device>, KillSwitchError> {
        let devices = match selector {
            KillSelector::Mac(mac) => self.registry.find_by_mac(mac).await?.into_iter().collect(),
            KillSelector::Port(port) => self.registry.find_by_port(*port).await?.into_iter().collect(),
            KillSelector::Tenant(tenant) => {
                self.registry
                    .list(&DeviceFilter {
                        tenant: Some(tenant.clone()),
                        status: None,
                    })
                    .await?
            }
        };
        Ok(devices)
    }

    /// Revoke credentials, stop tunnels and decommission every matching device.
    ///
    /// Devices are handled `kill_batch_size` at a time. A device whose
    /// credential could not be revoked is left undecommissioned so a repeat
    /// invocation picks it up again.
    pub async fn kill(&self, selector: &KillSelector) -> Result<KillReport, KillSwitchError> {
        let devices = self.resolve(selector).await?;
        let mut report = KillReport {
            selector: selector.to_string(),
            ..Default::default()
        };

        if devices.is_empty() {
            info!(%selector, "Kill switch matched no devices");
            return Ok(report);
        }

        info!(%selector, devices = devices.len(), "Kill switch engaged");
        let batch_size = self.config.kill_batch_size.max(1);

        for batch in devices.chunks(batch_size) {
            let revocations: Vec<_> = batch
                .iter()
                .map(|device| async move { (device, self.revoke_device(device).await) })
                .collect();
            let outcomes: Vec<(&Device, RevokeOutcome)> = stream::iter(revocations)
                .buffer_unordered(batch_size)
                .collect()
                .await;

            for (device, outcome) in outcomes {
                let mac = device.mac.to_string();
                match outcome {
                    RevokeOutcome::Revoked => report.revoked.push(mac),
                    RevokeOutcome::AlreadyDecommissioned => report.already_decommissioned.push(mac),
                    RevokeOutcome::Failed(error) => report.failed.push(DeviceFailure {
                        mac,
                        port: Some(device.port),
                        error,
                    }),
                }
            }
        }

        report.revoked.sort();
        report.already_decommissioned.sort();
        report.failed.sort_by(|a, b| a.mac.cmp(&b.mac));

        if report.is_complete() {
            info!(%selector, revoked = report.revoked.len(), "Kill switch complete");
        } else {
            warn!(
                %selector,
                revoked = report.revoked.len(),
                failed = report.failed.len(),
                "Kill switch partially failed"
            );
        }
        Ok(report)
    }

    async fn revoke_device(&self, device: &Device) -> RevokeOutcome {
        if device.status == DeviceStatus::Decommissioned {
            return RevokeOutcome::AlreadyDecommissioned;
        }

        if let Err(e) = self.credentials.revoke(&device.name).await {
            warn!(mac = %device.mac, "Failed to revoke credential: {}", e);
            // Still cut the live session; the key stays until a retry succeeds
            let stop = match self.tunnels.stop(device.port).await {
                Ok(()) => "session stopped".to_string(),
                Err(stop_err) => {
                    warn!(mac = %device.mac, port = device.port, "Failed to stop tunnel: {}", stop_err);
                    format!("session not stopped: {}", stop_err)
                }
            };
            return RevokeOutcome::Failed(format!("credential revocation failed: {}; {}", e, stop));
        }

        if let Err(e) = self.tunnels.stop(device.port).await {
            warn!(mac = %device.mac, port = device.port, "Failed to stop tunnel: {}", e);
            return RevokeOutcome::Failed(format!("key revoked, session not stopped: {}", e));
        }

        match self.registry.decommission(device.id).await {
            Ok(true) => {
                info!(mac = %device.mac, port = device.port, "Device decommissioned");
                RevokeOutcome::Revoked
            }
            Ok(false) => RevokeOutcome::AlreadyDecommissioned,
            Err(e) => {
                warn!(mac = %device.mac, "Failed to mark decommissioned: {}", e);
                RevokeOutcome::Failed(format!("registry update failed: {}", e))
            }
        }
    }
}
