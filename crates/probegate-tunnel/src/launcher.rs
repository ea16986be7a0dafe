//! Launching the outbound reverse tunnel process
//!
//! The default launcher runs the system `ssh` client with a remote forward
//! (`-R <port>:localhost:22`) to the proxy. SSH is used as-is; the launcher
//! only builds the command line and owns the child process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to launch tunnel process: {0}")]
    LaunchFailed(String),

    #[error("Tunnel connection lost: {0}")]
    ConnectionLost(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Service manager error: {0}")]
    ServiceError(String),
}

impl TunnelError {
    /// Returns true if retrying won't help until the configuration changes
    pub fn is_non_recoverable(&self) -> bool {
        matches!(self, TunnelError::ConfigError(_))
    }
}

/// Where the tunnel terminates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ssh_port: default_ssh_port(),
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Key material the tunnel authenticates with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    pub private_key: PathBuf,
}

/// Everything needed to bring up one device's tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Port assigned on the proxy
    pub port: u16,
    pub endpoint: ProxyEndpoint,
    pub credentials: TunnelCredentials,
    /// Local service exposed through the tunnel
    #[serde(default = "default_local_target")]
    pub local_target: String,
}

fn default_local_target() -> String {
    "localhost:22".to_string()
}

impl TunnelSpec {
    pub fn new(port: u16, endpoint: ProxyEndpoint, credentials: TunnelCredentials) -> Self {
        Self {
            port,
            endpoint,
            credentials,
            local_target: default_local_target(),
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.port == 0 {
            return Err(TunnelError::ConfigError("port must be non-zero".into()));
        }
        if self.endpoint.host.trim().is_empty() {
            return Err(TunnelError::ConfigError("proxy host is empty".into()));
        }
        if self.endpoint.user.trim().is_empty() {
            return Err(TunnelError::ConfigError("proxy user is empty".into()));
        }
        Ok(())
    }

    /// Arguments passed to `ssh`
    pub fn ssh_args(&self) -> Vec<String> {
        vec![
            "-N".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-i".to_string(),
            self.credentials.private_key.display().to_string(),
            "-p".to_string(),
            self.endpoint.ssh_port.to_string(),
            "-R".to_string(),
            format!("{}:{}", self.port, self.local_target),
            self.endpoint.destination(),
        ]
    }
}

/// A running connection process
#[async_trait]
pub trait TunnelProcess: Send {
    /// Wait for the connection to end. Must be cancel-safe.
    async fn wait(&mut self) -> Result<(), TunnelError>;

    /// Terminate immediately
    async fn kill(&mut self);
}

/// Starts connection processes for the supervisor
#[async_trait]
pub trait ConnectionLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError>;
}

/// Launches `ssh -N -R ...`
#[derive(Debug, Clone)]
pub struct SshLauncher {
    program: PathBuf,
}

impl SshLauncher {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ssh"),
        }
    }

    /// Use a specific ssh binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionLauncher for SshLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        spec.validate()?;

        let args = spec.ssh_args();
        debug!(port = spec.port, program = %self.program.display(), ?args, "Spawning ssh");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelError::LaunchFailed(format!("{}: {}", self.program.display(), e))
            })?;

        Ok(Box::new(SshProcess { child }))
    }
}

struct SshProcess {
    child: Child,
}

#[async_trait]
impl TunnelProcess for SshProcess {
    async fn wait(&mut self) -> Result<(), TunnelError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| TunnelError::ConnectionLost(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(TunnelError::ConnectionLost(format!("ssh exited with {}", status)))
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}
