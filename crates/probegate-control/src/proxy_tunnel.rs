//! Tunnel control on the proxy host
//!
//! The proxy does not own the probes' ssh processes; it can only tear down
//! the sshd session holding a forwarded port. Stopping runs a command
//! (by default `fuser -k -n tcp {port}`, which kills whatever holds the
//! listening socket) and then checks that the port stopped answering.
//! Revoking the key alone does not close a session that is already up.

use async_trait::async_trait;
use probegate_tunnel::{TunnelControl, TunnelError, TunnelState};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::probe::Prober;

/// Default argv used to terminate the session listening on a port
pub fn default_stop_command() -> Vec<String> {
    ["fuser", "-k", "-n", "tcp", "{port}"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// [`TunnelControl`] for tunnels terminating on this proxy
pub struct ProxyTunnelControl {
    stop_command: Vec<String>,
    prober: Arc<dyn Prober>,
    verify_attempts: u32,
    verify_interval: Duration,
}

impl ProxyTunnelControl {
    /// `stop_command` is an argv template; `{port}` is substituted.
    pub fn new(stop_command: Vec<String>, prober: Arc<dyn Prober>) -> Self {
        Self {
            stop_command,
            prober,
            verify_attempts: 10,
            verify_interval: Duration::from_millis(200),
        }
    }

    /// How often and how long to wait for the port to close after stopping
    pub fn with_verification(mut self, attempts: u32, interval: Duration) -> Self {
        self.verify_attempts = attempts.max(1);
        self.verify_interval = interval;
        self
    }

    fn render(&self, port: u16) -> Vec<String> {
        self.stop_command
            .iter()
            .map(|arg| arg.replace("{port}", &port.to_string()))
            .collect()
    }

    async fn wait_closed(&self, port: u16) -> bool {
        for attempt in 0..self.verify_attempts {
            if self.prober.probe(port).await.is_err() {
                return true;
            }
            if attempt + 1 < self.verify_attempts {
                tokio::time::sleep(self.verify_interval).await;
            }
        }
        false
    }
}

#[async_trait]
impl TunnelControl for ProxyTunnelControl {
    async fn stop(&self, port: u16) -> Result<(), TunnelError> {
        let argv = self.render(port);
        let Some((program, args)) = argv.split_first() else {
            return Err(TunnelError::ConfigError("no stop command configured".to_string()));
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| TunnelError::ServiceError(format!("Failed to run {}: {}", program, e)))?;

        if output.status.success() {
            debug!(port, "Stop command finished");
        } else {
            // Non-zero usually means nothing was listening
            debug!(port, status = %output.status, "Stop command found nothing to stop");
        }

        if !self.wait_closed(port).await {
            warn!(port, "Tunnel port still accepting connections after stop");
            return Err(TunnelError::ServiceError(format!(
                "port {} still accepting connections after stop",
                port
            )));
        }

        info!(port, "Stopped tunnel session on proxy");
        Ok(())
    }

    /// The proxy keeps no handles of its own; liveness comes from the prober.
    async fn state(&self, _port: u16) -> Option<TunnelState> {
        None
    }
}
