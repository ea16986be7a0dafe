//! Reading the probe's own hardware address

use async_trait::async_trait;
use probegate_proto::MacAddress;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::BootstrapError;

#[async_trait]
pub trait MacSource: Send + Sync {
    async fn mac_address(&self) -> Result<MacAddress, BootstrapError>;
}

/// Reads `/sys/class/net/<iface>/address`, falling back to `ip link show`
#[derive(Debug, Clone)]
pub struct SysfsMacSource {
    sys_class_net: PathBuf,
    interface: String,
}

impl SysfsMacSource {
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_root("/sys/class/net", interface)
    }

    pub fn with_root(sys_class_net: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            sys_class_net: sys_class_net.into(),
            interface: interface.into(),
        }
    }

    async fn from_ip_command(&self) -> Result<String, BootstrapError> {
        let output = Command::new("ip")
            .args(["link", "show", &self.interface])
            .output()
            .await
            .map_err(|e| BootstrapError::Fatal(format!("Failed to run ip: {}", e)))?;

        if !output.status.success() {
            return Err(BootstrapError::Fatal(format!("Interface {} not found", self.interface)));
        }

        parse_ip_link(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            BootstrapError::Fatal(format!("Could not find MAC address for interface {}", self.interface))
        })
    }
}

/// Extract the `link/ether` address from `ip link show` output
fn parse_ip_link(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "link/ether" {
                return fields.next().map(str::to_string);
            }
        }
        None
    })
}

#[async_trait]
impl MacSource for SysfsMacSource {
    async fn mac_address(&self) -> Result<MacAddress, BootstrapError> {
        let sys_path = self.sys_class_net.join(&self.interface).join("address");

        let raw = match tokio::fs::read_to_string(&sys_path).await {
            Ok(contents) => {
                debug!(path = %sys_path.display(), "MAC address from sysfs");
                contents.trim().to_string()
            }
            Err(_) => self.from_ip_command().await?,
        };

        let mac: MacAddress = raw
            .parse()
            .map_err(|e| BootstrapError::Fatal(format!("Invalid MAC '{}' on {}: {}", raw, self.interface, e)))?;
        info!(interface = %self.interface, mac = %mac, "Detected MAC address");
        Ok(mac)
    }
}
