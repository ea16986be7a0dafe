//! First-boot bootstrap state machine

use chrono::Utc;
use probegate_proto::{MacAddress, RegistrationNotice, RequestPortResponse};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::client::{PortClient, RegistrationTrigger};
use crate::error::BootstrapError;
use crate::installer::TunnelInstaller;
use crate::keys::{KeyPair, KeyProvider};
use crate::mac::MacSource;
use crate::marker::CompletionMarker;
use crate::retry::{with_retry, RetryPolicy};
use crate::tenant::TenantIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Unregistered,
    PortRequested,
    KeyReady,
    TunnelStarted,
    NotifiedController,
    Complete,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapState::Unregistered => "unregistered",
            BootstrapState::PortRequested => "port_requested",
            BootstrapState::KeyReady => "key_ready",
            BootstrapState::TunnelStarted => "tunnel_started",
            BootstrapState::NotifiedController => "notified_controller",
            BootstrapState::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The marker was already there; nothing was done
    AlreadyComplete { proxy_port: Option<u16> },
    Completed { proxy_port: u16 },
}

/// The external collaborators of a bootstrap run
pub struct BootstrapSeams {
    pub mac_source: Arc<dyn MacSource>,
    pub ports: Arc<dyn PortClient>,
    pub keys: Arc<dyn KeyProvider>,
    pub tunnels: Arc<dyn TunnelInstaller>,
    /// `None` skips controller notification
    pub trigger: Option<Arc<dyn RegistrationTrigger>>,
}

/// Per-run settings that are not seams
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub tenant_config_paths: Vec<PathBuf>,
    pub marker: CompletionMarker,
    pub retry: RetryPolicy,
    pub hostname: String,
    pub host_config_key: Option<String>,
}

pub struct BootstrapAgent {
    seams: BootstrapSeams,
    settings: BootstrapSettings,
    state: BootstrapState,
}

impl BootstrapAgent {
    pub fn new(settings: BootstrapSettings, seams: BootstrapSeams) -> Self {
        Self {
            seams,
            settings,
            state: BootstrapState::Unregistered,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    fn advance(&mut self, next: BootstrapState) {
        info!(from = %self.state, to = %next, "Bootstrap state transition");
        self.state = next;
    }

    /// Drive the probe from first boot to a registered, tunnelled device.
    ///
    /// Every step is idempotent, so a run interrupted at any point can simply
    /// be repeated. The marker is only written after the controller has been
    /// notified.
    pub async fn run(&mut self) -> Result<BootstrapOutcome, BootstrapError> {
        if self.settings.marker.is_present().await {
            let record = self.settings.marker.read().await;
            let proxy_port = record.and_then(|r| r.proxy_port);
            info!(
                marker = %self.settings.marker.path().display(),
                port = ?proxy_port,
                "Bootstrap already complete, nothing to do"
            );
            self.state = BootstrapState::Complete;
            return Ok(BootstrapOutcome::AlreadyComplete { proxy_port });
        }

        let identity = TenantIdentity::load(&self.settings.tenant_config_paths)?;
        let mac = self.seams.mac_source.mac_address().await?;
        info!(
            tenant = %identity.tenant_slug,
            site = %identity.site_slug,
            mac = %mac,
            "Starting bootstrap"
        );

        let assignment = self.request_port(&mac).await?;
        let port = assignment.port;
        self.advance(BootstrapState::PortRequested);

        let keypair = self.seams.keys.ensure_keypair().await?;
        self.advance(BootstrapState::KeyReady);

        let tunnels = self.seams.tunnels.clone();
        let changed = with_retry(&self.settings.retry, "tunnel install", || tunnels.install(port)).await?;
        if !changed {
            info!(port, "Tunnel already installed");
        }
        self.advance(BootstrapState::TunnelStarted);

        self.notify(&mac, port, &identity, &keypair).await?;
        self.advance(BootstrapState::NotifiedController);

        self.settings.marker.write(port).await?;
        self.advance(BootstrapState::Complete);

        info!(port, device = %assignment.device_name, "Bootstrap complete");
        Ok(BootstrapOutcome::Completed { proxy_port: port })
    }

    async fn request_port(&self, mac: &MacAddress) -> Result<RequestPortResponse, BootstrapError> {
        let ports = self.seams.ports.clone();
        with_retry(&self.settings.retry, "port request", || ports.request_port(mac)).await
    }

    async fn notify(
        &self,
        mac: &MacAddress,
        port: u16,
        identity: &TenantIdentity,
        keypair: &KeyPair,
    ) -> Result<(), BootstrapError> {
        let Some(trigger) = self.seams.trigger.clone() else {
            warn!("No registration trigger configured, skipping controller notification");
            return Ok(());
        };

        let notice = RegistrationNotice {
            mac: *mac,
            port,
            tenant: identity.tenant.clone(),
            tenant_slug: identity.tenant_slug.clone(),
            site: identity.site.clone(),
            site_slug: identity.site_slug.clone(),
            public_key: keypair.public_key.clone(),
            hostname: self.settings.hostname.clone(),
            timestamp: Utc::now(),
            host_config_key: self.settings.host_config_key.clone(),
        };

        with_retry(&self.settings.retry, "registration trigger", || trigger.notify(&notice)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use probegate_proto::PortOrigin;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedMac(Result<MacAddress, BootstrapError>);

    #[async_trait]
    impl MacSource for FixedMac {
        async fn mac_address(&self) -> Result<MacAddress, BootstrapError> {
            self.0.clone()
        }
    }

    /// Replays scripted failures, then assigns port 10001
    #[derive(Default)]
    struct ScriptedPorts {
        failures: Mutex<VecDeque<BootstrapError>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl PortClient for ScriptedPorts {
        async fn request_port(&self, mac: &MacAddress) -> Result<RequestPortResponse, BootstrapError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(RequestPortResponse {
                port: 10001,
                status: PortOrigin::New,
                mac: *mac,
                device_name: probegate_proto::device_name(mac),
            })
        }
    }

    struct StaticKeys;

    #[async_trait]
    impl KeyProvider for StaticKeys {
        async fn ensure_keypair(&self) -> Result<KeyPair, BootstrapError> {
            Ok(KeyPair {
                private_key: PathBuf::from("/tmp/probe_key"),
                public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGqk root@probe".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingInstaller {
        ports: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl TunnelInstaller for RecordingInstaller {
        async fn install(&self, port: u16) -> Result<bool, BootstrapError> {
            self.ports.lock().unwrap().push(port);
            Ok(true)
        }
    }

    #[derive(Default)]
    struct RecordingTrigger {
        notices: Mutex<Vec<RegistrationNotice>>,
        fail_with: Mutex<Option<BootstrapError>>,
    }

    #[async_trait]
    impl RegistrationTrigger for RecordingTrigger {
        async fn notify(&self, notice: &RegistrationNotice) -> Result<(), BootstrapError> {
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        ports: Arc<ScriptedPorts>,
        installer: Arc<RecordingInstaller>,
        trigger: Arc<RecordingTrigger>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("probe_config.txt"), "TENANT_NAME=Acme Corp\nSITE_NAME=Main Office\n")
                .unwrap();
            Self {
                dir,
                ports: Arc::new(ScriptedPorts::default()),
                installer: Arc::new(RecordingInstaller::default()),
                trigger: Arc::new(RecordingTrigger::default()),
            }
        }

        fn marker(&self) -> CompletionMarker {
            CompletionMarker::new(self.dir.path().join("probe_bootstrap_complete"))
        }

        fn agent(&self, mac: Result<MacAddress, BootstrapError>) -> BootstrapAgent {
            BootstrapAgent::new(
                BootstrapSettings {
                    tenant_config_paths: vec![
                        self.dir.path().join("missing.txt"),
                        self.dir.path().join("probe_config.txt"),
                    ],
                    marker: self.marker(),
                    retry: RetryPolicy {
                        max_attempts: 3,
                        initial_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(2),
                    },
                    hostname: "probe-01".into(),
                    host_config_key: Some("hck-123".into()),
                },
                BootstrapSeams {
                    mac_source: Arc::new(FixedMac(mac)),
                    ports: self.ports.clone(),
                    keys: Arc::new(StaticKeys),
                    tunnels: self.installer.clone(),
                    trigger: Some(self.trigger.clone()),
                },
            )
        }
    }

    fn mac() -> MacAddress {
        "aa:bb:cc:dd:ee:ff".parse().unwrap()
    }

    #[tokio::test]
    async fn test_full_run_reaches_complete() {
        let fx = Fixture::new();
        let mut agent = fx.agent(Ok(mac()));

        let outcome = agent.run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Completed { proxy_port: 10001 });
        assert_eq!(agent.state(), BootstrapState::Complete);
        assert_eq!(*fx.installer.ports.lock().unwrap(), vec![10001]);

        let notices = fx.trigger.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        let notice = &notices[0];
        assert_eq!(notice.mac, mac());
        assert_eq!(notice.port, 10001);
        assert_eq!(notice.tenant_slug, "acme_corp");
        assert_eq!(notice.site_slug, "main_office");
        assert_eq!(notice.hostname, "probe-01");
        assert_eq!(notice.host_config_key.as_deref(), Some("hck-123"));
        assert!(notice.public_key.starts_with("ssh-ed25519 "));

        assert_eq!(fx.marker().read().await.unwrap().proxy_port, Some(10001));
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let fx = Fixture::new();
        fx.agent(Ok(mac())).run().await.unwrap();

        let mut again = fx.agent(Ok(mac()));
        let outcome = again.run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::AlreadyComplete { proxy_port: Some(10001) });
        assert_eq!(*fx.ports.calls.lock().unwrap(), 1);
        assert_eq!(fx.trigger.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_port_failures_are_retried() {
        let fx = Fixture::new();
        fx.ports
            .failures
            .lock()
            .unwrap()
            .extend([BootstrapError::Retryable("503".into()), BootstrapError::Retryable("timeout".into())]);

        let outcome = fx.agent(Ok(mac())).run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Completed { proxy_port: 10001 });
        assert_eq!(*fx.ports.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_leave_no_marker() {
        let fx = Fixture::new();
        fx.ports
            .failures
            .lock()
            .unwrap()
            .push_back(BootstrapError::Fatal("400 Bad Request".into()));

        let mut agent = fx.agent(Ok(mac()));
        let err = agent.run().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(agent.state(), BootstrapState::Unregistered);
        assert_eq!(*fx.ports.calls.lock().unwrap(), 1);
        assert!(!fx.marker().is_present().await);
    }

    #[tokio::test]
    async fn test_missing_interface_is_fatal() {
        let fx = Fixture::new();
        let mut agent = fx.agent(Err(BootstrapError::Fatal("Interface eth0 not found".into())));
        let err = agent.run().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(*fx.ports.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_trigger_exhausts_budget_without_marker() {
        let fx = Fixture::new();
        *fx.trigger.fail_with.lock().unwrap() = Some(BootstrapError::Retryable("connection refused".into()));

        let mut agent = fx.agent(Ok(mac()));
        let err = agent.run().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(agent.state(), BootstrapState::TunnelStarted);
        assert!(!fx.marker().is_present().await);

        // Retrying later repeats the idempotent steps and finishes
        *fx.trigger.fail_with.lock().unwrap() = None;
        let outcome = fx.agent(Ok(mac())).run().await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Completed { proxy_port: 10001 });
        assert_eq!(*fx.installer.ports.lock().unwrap(), vec![10001, 10001]);
    }

    #[tokio::test]
    async fn test_missing_tenant_config_is_fatal() {
        let fx = Fixture::new();
        std::fs::remove_file(fx.dir.path().join("probe_config.txt")).unwrap();
        let err = fx.agent(Ok(mac())).run().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(*fx.ports.calls.lock().unwrap(), 0);
    }
}
