//! Making the tunnel persistent on the probe

use async_trait::async_trait;
use probegate_tunnel::{SystemdInstaller, SystemdUnit, TunnelError};
use std::path::PathBuf;

use crate::error::BootstrapError;

#[async_trait]
pub trait TunnelInstaller: Send + Sync {
    /// Create and enable the persistent tunnel for `port`.
    ///
    /// Returns `Ok(false)` when an identical tunnel was already running.
    async fn install(&self, port: u16) -> Result<bool, BootstrapError>;
}

/// Installs a systemd unit that runs `probe-bootstrap supervise --port N`
#[derive(Debug, Clone)]
pub struct SystemdTunnelInstaller {
    systemd: SystemdInstaller,
    program: PathBuf,
    config_path: PathBuf,
}

impl SystemdTunnelInstaller {
    pub fn new(systemd: SystemdInstaller, program: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            systemd,
            program: program.into(),
            config_path: config_path.into(),
        }
    }

    pub fn unit(&self, port: u16) -> SystemdUnit {
        let exec_start = format!(
            "{} --config {} supervise --port {}",
            self.program.display(),
            self.config_path.display(),
            port
        );
        SystemdUnit::for_tunnel(port, exec_start)
    }
}

#[async_trait]
impl TunnelInstaller for SystemdTunnelInstaller {
    async fn install(&self, port: u16) -> Result<bool, BootstrapError> {
        self.systemd.install(&self.unit(port)).await.map_err(|e| match e {
            TunnelError::ConfigError(reason) => BootstrapError::Fatal(reason),
            other => BootstrapError::Retryable(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unit_runs_supervisor_for_port() {
        let installer = SystemdTunnelInstaller::new(
            SystemdInstaller::new(),
            "/usr/local/bin/probe-bootstrap",
            "/etc/probegate/bootstrap.yaml",
        );
        let unit = installer.unit(10001);
        assert_eq!(unit.name, "probegate-tunnel-10001.service");
        assert_eq!(
            unit.exec_start,
            "/usr/local/bin/probe-bootstrap --config /etc/probegate/bootstrap.yaml supervise --port 10001"
        );
    }

    #[tokio::test]
    async fn test_systemctl_failure_is_retryable() {
        let dir = TempDir::new().unwrap();
        let installer = SystemdTunnelInstaller::new(
            SystemdInstaller::with_paths(dir.path(), "/nonexistent/systemctl"),
            "/usr/local/bin/probe-bootstrap",
            "/etc/probegate/bootstrap.yaml",
        );

        let err = installer.install(10001).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(dir.path().join("probegate-tunnel-10001.service").exists());
    }
}
