//! Persistent tunnel service installation (systemd)
//!
//! The bootstrap agent makes the tunnel survive reboots by installing a unit
//! that runs the supervisor for the assigned port.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::launcher::TunnelError;

/// A rendered systemd service unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemdUnit {
    /// Unit name including the `.service` suffix
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub restart_sec: u32,
}

impl SystemdUnit {
    /// Unit running the tunnel supervisor for one port
    pub fn for_tunnel(port: u16, exec_start: impl Into<String>) -> Self {
        Self {
            name: Self::tunnel_unit_name(port),
            description: format!("Probegate reverse tunnel to proxy (port {})", port),
            exec_start: exec_start.into(),
            restart_sec: 10,
        }
    }

    pub fn tunnel_unit_name(port: u16) -> String {
        format!("probegate-tunnel-{}.service", port)
    }

    pub fn render(&self) -> String {
        format!(
            r#"[Unit]
Description={description}
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User=root
ExecStart={exec_start}
Restart=always
RestartSec={restart_sec}

[Install]
WantedBy=multi-user.target
"#,
            description = self.description,
            exec_start = self.exec_start,
            restart_sec = self.restart_sec,
        )
    }
}

/// Writes units and drives `systemctl`
#[derive(Debug, Clone)]
pub struct SystemdInstaller {
    unit_dir: PathBuf,
    systemctl: PathBuf,
}

impl SystemdInstaller {
    pub fn new() -> Self {
        Self {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            systemctl: PathBuf::from("systemctl"),
        }
    }

    pub fn with_paths(unit_dir: impl Into<PathBuf>, systemctl: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            systemctl: systemctl.into(),
        }
    }

    pub fn unit_path(&self, unit: &SystemdUnit) -> PathBuf {
        self.unit_dir.join(&unit.name)
    }

    /// Install, enable and start the unit.
    ///
    /// Returns `Ok(false)` without touching systemd when an identical unit
    /// is already installed and active.
    pub async fn install(&self, unit: &SystemdUnit) -> Result<bool, TunnelError> {
        let path = self.unit_path(unit);
        let rendered = unit.render();

        let unchanged = match tokio::fs::read_to_string(&path).await {
            Ok(current) => current == rendered,
            Err(_) => false,
        };

        if unchanged && self.is_active(&unit.name).await {
            info!(unit = %unit.name, "Tunnel service already installed and active");
            return Ok(false);
        }

        if !unchanged {
            write_unit(&path, &rendered).await?;
            info!(path = %path.display(), "Wrote tunnel service unit");
            self.systemctl(&["daemon-reload"]).await?;
        }

        self.systemctl(&["enable", "--now", &unit.name]).await?;
        info!(unit = %unit.name, "Tunnel service enabled and started");
        Ok(true)
    }

    pub async fn is_active(&self, unit_name: &str) -> bool {
        match Command::new(&self.systemctl)
            .args(["is-active", "--quiet", unit_name])
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("systemctl is-active failed: {}", e);
                false
            }
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), TunnelError> {
        let output = Command::new(&self.systemctl)
            .args(args)
            .output()
            .await
            .map_err(|e| TunnelError::ServiceError(format!("Failed to execute systemctl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::ServiceError(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

impl Default for SystemdInstaller {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_unit(path: &Path, contents: &str) -> Result<(), TunnelError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TunnelError::ServiceError(format!("Failed to create {}: {}", dir.display(), e)))?;
    }

    tokio::fs::write(path, contents)
        .await
        .map_err(|e| TunnelError::ServiceError(format!("Failed to write {}: {}", path.display(), e)))
}
