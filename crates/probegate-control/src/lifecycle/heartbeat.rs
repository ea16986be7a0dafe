//! Heartbeat sweep

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use probegate_proto::{DeviceFailure, DeviceStatus, SweepReport};
use probegate_tunnel::TunnelState;
use tracing::{debug, info, warn};

use super::LifecycleController;
use crate::error::RegistryError;
use crate::registry::{Device, LivenessUpdate};

enum DeviceOutcome {
    Reachable { recovered: bool },
    Unreachable { went_offline: bool },
    /// Changed by someone else mid-sweep (e.g. the kill switch)
    Skipped,
    Failed(DeviceFailure),
}

/// Next liveness state for `device` given one probe result
pub(crate) fn evaluate(
    device: &Device,
    reachable: bool,
    threshold: u32,
    now: DateTime<Utc>,
) -> LivenessUpdate {
    if reachable {
        return LivenessUpdate {
            expected: device.status,
            status: DeviceStatus::Active,
            consecutive_failures: 0,
            last_heartbeat: Some(now),
        };
    }

    let failures = device.consecutive_failures.saturating_add(1);
    let status = match device.status {
        // Unacknowledged devices are not yet expected to answer
        DeviceStatus::Pending => DeviceStatus::Pending,
        _ if failures >= threshold => DeviceStatus::Offline,
        current => current,
    };

    LivenessUpdate {
        expected: device.status,
        status,
        consecutive_failures: failures,
        last_heartbeat: None,
    }
}

impl LifecycleController {
    /// Probe every monitored device once and record the results.
    ///
    /// Only failing to list devices aborts the sweep; per-device errors are
    /// collected in the report.
    pub async fn sweep(&self) -> Result<SweepReport, RegistryError> {
        let _guard = self.sweep_lock.lock().await;

        let devices = self.registry.list_monitored().await?;
        let mut report = SweepReport {
            probed: devices.len(),
            ..Default::default()
        };
        debug!(devices = devices.len(), "Starting heartbeat sweep");

        let concurrency = self.config.probe_concurrency.max(1);
        let outcomes: Vec<(String, DeviceOutcome)> = stream::iter(devices)
            .map(|device| async move {
                let mac = device.mac.to_string();
                (mac, self.check_device(device).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (mac, outcome) in outcomes {
            match outcome {
                DeviceOutcome::Reachable { recovered } => {
                    report.reachable += 1;
                    if recovered {
                        report.recovered.push(mac);
                    }
                }
                DeviceOutcome::Unreachable { went_offline } => {
                    report.unreachable += 1;
                    if went_offline {
                        report.went_offline.push(mac);
                    }
                }
                DeviceOutcome::Skipped => {}
                DeviceOutcome::Failed(failure) => report.errors.push(failure),
            }
        }

        report.recovered.sort();
        report.went_offline.sort();

        info!(
            probed = report.probed,
            reachable = report.reachable,
            unreachable = report.unreachable,
            went_offline = report.went_offline.len(),
            recovered = report.recovered.len(),
            errors = report.errors.len(),
            "Heartbeat sweep finished"
        );
        Ok(report)
    }

    async fn is_reachable(&self, port: u16) -> bool {
        match self.prober.probe(port).await {
            Ok(()) => true,
            Err(e) => {
                debug!(port, "Probe failed: {}", e);
                self.tunnels.state(port).await == Some(TunnelState::Connected)
            }
        }
    }

    async fn check_device(&self, device: Device) -> DeviceOutcome {
        let reachable = self.is_reachable(device.port).await;
        let update = evaluate(&device, reachable, self.config.failure_threshold, Utc::now());
        let previous = device.status;
        let next = update.status;

        match self.registry.apply_liveness(device.id, update).await {
            Ok(Some(_)) if reachable => {
                let recovered = previous != DeviceStatus::Active;
                if recovered {
                    info!(mac = %device.mac, port = device.port, from = %previous, "Device is active");
                }
                DeviceOutcome::Reachable { recovered }
            }
            Ok(Some(updated)) => {
                let went_offline = previous != DeviceStatus::Offline && next == DeviceStatus::Offline;
                if went_offline {
                    warn!(
                        mac = %device.mac,
                        port = device.port,
                        failures = updated.consecutive_failures,
                        "Device went offline"
                    );
                }
                DeviceOutcome::Unreachable { went_offline }
            }
            Ok(None) => {
                debug!(mac = %device.mac, "Device changed during sweep, skipping");
                DeviceOutcome::Skipped
            }
            Err(e) => {
                warn!(mac = %device.mac, port = device.port, "Failed to record heartbeat: {}", e);
                DeviceOutcome::Failed(DeviceFailure {
                    mac: device.mac.to_string(),
                    port: Some(device.port),
                    error: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::testing::harness;
    use crate::lifecycle::LifecycleConfig;
    use crate::registry::{AllocationOutcome, DeviceRegistry, PortRange, Registration};
    use probegate_proto::MacAddress;

    const RANGE: PortRange = PortRange {
        base: 10001,
        max: None,
    };

    fn config(threshold: u32) -> LifecycleConfig {
        LifecycleConfig {
            failure_threshold: threshold,
            ..Default::default()
        }
    }

    async fn active_device(registry: &dyn DeviceRegistry, mac: &str) -> Device {
        let mac: MacAddress = mac.parse().unwrap();
        match registry.allocate(&mac, RANGE).await.unwrap() {
            AllocationOutcome::Created(_) => {}
            other => panic!("unexpected {:?}", other),
        }
        registry
            .register(
                &mac,
                Registration {
                    tenant: "acme".into(),
                    site: None,
                    public_key: None,
                },
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_evaluate_transitions() {
        let now = Utc::now();
        let mut device = Device {
            id: uuid::Uuid::new_v4(),
            mac: MacAddress::new([1, 2, 3, 4, 5, 6]),
            name: "probe-010203040506".into(),
            tenant: None,
            site: None,
            port: 10001,
            status: DeviceStatus::Active,
            public_key: None,
            registered_at: None,
            last_heartbeat: None,
            consecutive_failures: 1,
            created_at: now,
            updated_at: now,
        };

        let update = evaluate(&device, false, 3, now);
        assert_eq!(update.status, DeviceStatus::Active);
        assert_eq!(update.consecutive_failures, 2);

        device.consecutive_failures = 2;
        assert_eq!(evaluate(&device, false, 3, now).status, DeviceStatus::Offline);

        device.status = DeviceStatus::Pending;
        assert_eq!(evaluate(&device, false, 3, now).status, DeviceStatus::Pending);

        let update = evaluate(&device, true, 3, now);
        assert_eq!(update.status, DeviceStatus::Active);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.last_heartbeat, Some(now));
    }

    #[tokio::test]
    async fn test_threshold_minus_one_failures_keeps_active() {
        let h = harness(config(3)).await;
        let device = active_device(h.registry.as_ref(), "aa:00:00:00:00:01").await;
        h.prober.set_down(device.port, true);

        for _ in 0..2 {
            h.controller.sweep().await.unwrap();
        }

        let stored = h.registry.find_by_mac(&device.mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Active);
        assert_eq!(stored.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_threshold_failures_mark_offline_then_recover() {
        let h = harness(config(3)).await;
        let device = active_device(h.registry.as_ref(), "aa:00:00:00:00:01").await;
        h.prober.set_down(device.port, true);

        let mut offline_reports = 0;
        for _ in 0..3 {
            let report = h.controller.sweep().await.unwrap();
            offline_reports += report.went_offline.len();
        }
        assert_eq!(offline_reports, 1);

        let stored = h.registry.find_by_mac(&device.mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Offline);

        h.prober.set_down(device.port, false);
        let report = h.controller.sweep().await.unwrap();
        assert_eq!(report.recovered, vec![device.mac.to_string()]);

        let stored = h.registry.find_by_mac(&device.mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Active);
        assert_eq!(stored.consecutive_failures, 0);
        assert!(stored.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_single_success_resets_counter() {
        let h = harness(config(3)).await;
        let device = active_device(h.registry.as_ref(), "aa:00:00:00:00:01").await;

        h.prober.set_down(device.port, true);
        h.controller.sweep().await.unwrap();
        h.controller.sweep().await.unwrap();
        h.prober.set_down(device.port, false);
        h.controller.sweep().await.unwrap();
        h.prober.set_down(device.port, true);
        h.controller.sweep().await.unwrap();
        h.controller.sweep().await.unwrap();

        let stored = h.registry.find_by_mac(&device.mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Active);
        assert_eq!(stored.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_pending_device_activates_on_first_success() {
        let h = harness(config(1)).await;
        let mac: MacAddress = "aa:00:00:00:00:02".parse().unwrap();
        h.registry.allocate(&mac, RANGE).await.unwrap();

        h.prober.set_down(10001, true);
        h.controller.sweep().await.unwrap();
        let stored = h.registry.find_by_mac(&mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Pending);

        h.prober.set_down(10001, false);
        let report = h.controller.sweep().await.unwrap();
        assert_eq!(report.recovered, vec![mac.to_string()]);
        let stored = h.registry.find_by_mac(&mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Active);
    }

    #[tokio::test]
    async fn test_offline_device_age_is_kept_while_failing() {
        let h = harness(config(1)).await;
        let device = active_device(h.registry.as_ref(), "aa:00:00:00:00:03").await;
        h.prober.set_down(device.port, true);

        h.controller.sweep().await.unwrap();
        let offline_since = h.registry.find_by_mac(&device.mac).await.unwrap().unwrap().updated_at;

        h.controller.sweep().await.unwrap();
        let stored = h.registry.find_by_mac(&device.mac).await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Offline);
        assert_eq!(stored.updated_at, offline_since);
    }
}
