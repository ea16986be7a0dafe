//! Cleanup: archive devices that stayed offline or decommissioned past retention

use chrono::Utc;
use probegate_proto::{DeviceFailure, DeviceStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::LifecycleController;
use crate::error::RegistryError;
use crate::registry::Device;

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// MACs moved to the archive; their ports are free again
    pub archived: Vec<String>,
    pub errors: Vec<DeviceFailure>,
}

impl LifecycleController {
    pub async fn cleanup(&self) -> Result<CleanupReport, RegistryError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let cutoff = Utc::now() - retention;

        let candidates = self.registry.list_archivable(cutoff).await?;
        let mut report = CleanupReport::default();

        for device in candidates {
            match self.archive_device(&device, cutoff).await {
                Ok(true) => report.archived.push(device.mac.to_string()),
                Ok(false) => {}
                Err(error) => {
                    warn!(mac = %device.mac, "Failed to archive device: {}", error);
                    report.errors.push(DeviceFailure {
                        mac: device.mac.to_string(),
                        port: Some(device.port),
                        error,
                    });
                }
            }
        }

        if !report.archived.is_empty() || !report.errors.is_empty() {
            info!(
                archived = report.archived.len(),
                errors = report.errors.len(),
                "Cleanup pass finished"
            );
        }
        Ok(report)
    }

    async fn archive_device(
        &self,
        device: &Device,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<bool, String> {
        // Offline devices still hold a key; it must go before the port is reusable
        if device.status == DeviceStatus::Offline {
            self.credentials
                .revoke(&device.name)
                .await
                .map_err(|e| format!("credential revocation failed: {}", e))?;
            self.tunnels
                .stop(device.port)
                .await
                .map_err(|e| format!("tunnel stop failed: {}", e))?;
        }

        let archived = self
            .registry
            .archive(device.id, cutoff)
            .await
            .map_err(|e| e.to_string())?;

        if archived {
            info!(mac = %device.mac, port = device.port, status = %device.status, "Archived device, port released");
        }
        Ok(archived)
    }
}
