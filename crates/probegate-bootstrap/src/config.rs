//! Bootstrap agent configuration

use probegate_tunnel::ProxyEndpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BootstrapError;
use crate::retry::{secs, RetryPolicy};
use crate::tenant::DEFAULT_CONFIG_PATHS;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/probegate/bootstrap.yaml";
pub const DEFAULT_MARKER_PATH: &str = "/var/lib/probe_bootstrap_complete";

/// Everything the probe needs to bootstrap itself.
///
/// Loaded from YAML; every field has a default except the gatekeeper URL and
/// the proxy host, which `validate` insists on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Base URL of the Port Allocation Service
    pub gatekeeper_url: String,
    /// Registration trigger endpoint; notification is skipped when unset
    pub registration_url: Option<String>,
    /// Opaque key forwarded to the automation controller
    pub host_config_key: Option<String>,
    /// Interface whose MAC identifies the probe
    pub interface: String,
    /// Tenant configuration files, first readable one wins
    pub tenant_config_paths: Vec<PathBuf>,
    pub marker_path: PathBuf,
    pub private_key_path: PathBuf,
    pub proxy: ProxyEndpoint,
    #[serde(with = "secs")]
    pub http_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            gatekeeper_url: String::new(),
            registration_url: None,
            host_config_key: None,
            interface: "eth0".to_string(),
            tenant_config_paths: DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect(),
            marker_path: PathBuf::from(DEFAULT_MARKER_PATH),
            private_key_path: PathBuf::from("/root/.ssh/probegate_ed25519"),
            proxy: ProxyEndpoint::new("", "probe"),
            http_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl BootstrapConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, BootstrapError> {
        serde_yaml::from_str(contents)
            .map_err(|e| BootstrapError::Fatal(format!("Invalid bootstrap configuration: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, BootstrapError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BootstrapError::Fatal(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.gatekeeper_url.trim().is_empty() {
            return Err(BootstrapError::Fatal("gatekeeper_url must be set".into()));
        }
        if !self.gatekeeper_url.starts_with("http://") && !self.gatekeeper_url.starts_with("https://") {
            return Err(BootstrapError::Fatal(format!(
                "gatekeeper_url must be an http(s) URL, got '{}'",
                self.gatekeeper_url
            )));
        }
        if matches!(&self.registration_url, Some(url) if url.trim().is_empty()) {
            return Err(BootstrapError::Fatal("registration_url must not be empty".into()));
        }
        if self.interface.trim().is_empty() {
            return Err(BootstrapError::Fatal("interface must be set".into()));
        }
        if self.tenant_config_paths.is_empty() {
            return Err(BootstrapError::Fatal("tenant_config_paths must not be empty".into()));
        }
        if self.proxy.host.trim().is_empty() || self.proxy.user.trim().is_empty() {
            return Err(BootstrapError::Fatal("proxy host and user must be set".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(BootstrapError::Fatal("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
