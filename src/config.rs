//! Server configuration file (`probegate.yaml`)

use anyhow::{bail, Context, Result};
use probegate_control::{default_stop_command, AllocatorConfig, LifecycleConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    /// Run registry migrations on `serve`
    pub auto_migrate: bool,
    pub allocator: AllocatorConfig,
    pub lifecycle: LifecycleConfig,
    pub proxy: ProxyConfig,
}

/// How the gatekeeper reaches tunnels and credentials on the proxy host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host the tunnels listen on, as seen from the gatekeeper
    pub probe_host: String,
    /// Heartbeat TCP connect timeout in seconds
    pub probe_timeout_secs: u64,
    pub authorized_keys: PathBuf,
    /// argv run to terminate the session holding a tunnel port; `{port}` is substituted
    pub stop_command: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./probegate.db?mode=rwc".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: false,
            auto_migrate: true,
            allocator: AllocatorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            probe_host: "127.0.0.1".to_string(),
            probe_timeout_secs: 5,
            authorized_keys: PathBuf::from("/home/probe/.ssh/authorized_keys"),
            stop_command: default_stop_command(),
        }
    }
}

impl ProxyConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl ServerConfig {
    /// Load from `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("database_url must be set");
        }
        if self.allocator.base_port == 0 {
            bail!("allocator.base_port must be non-zero");
        }
        if let Some(max) = self.allocator.max_port {
            if max < self.allocator.base_port {
                bail!(
                    "allocator.max_port ({}) is below base_port ({})",
                    max,
                    self.allocator.base_port
                );
            }
        }
        if self.lifecycle.failure_threshold == 0 {
            bail!("lifecycle.failure_threshold must be at least 1");
        }
        if self.lifecycle.kill_batch_size == 0 {
            bail!("lifecycle.kill_batch_size must be at least 1");
        }
        if self.lifecycle.probe_concurrency == 0 {
            bail!("lifecycle.probe_concurrency must be at least 1");
        }
        if self.lifecycle.heartbeat_interval.is_zero() || self.lifecycle.cleanup_interval.is_zero() {
            bail!("lifecycle intervals must be non-zero");
        }
        if self.proxy.probe_host.trim().is_empty() {
            bail!("proxy.probe_host must be set");
        }
        if self.proxy.stop_command.first().map_or(true, |p| p.trim().is_empty()) {
            bail!("proxy.stop_command must name a program");
        }
        Ok(())
    }
}
