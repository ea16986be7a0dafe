//! Per-port tunnel supervision
//!
//! One supervision task per assigned port. The task owns the connection
//! process and is the only writer of that port's state while it runs;
//! `stop` cancels the task and kills the process before marking the
//! handle stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::launcher::{ConnectionLauncher, TunnelError, TunnelSpec};

/// Runtime state of a supervised tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TunnelState {
    Starting,
    Connected,
    Reconnecting { attempt: u32 },
    Stopped,
}

/// Hook used by the lifecycle controller to revoke and probe tunnels
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Hard-stop the tunnel bound to `port`. Stopping an unknown or
    /// already-stopped tunnel succeeds.
    async fn stop(&self, port: u16) -> Result<(), TunnelError>;

    /// Current state, `None` if this controller has never seen the port
    async fn state(&self, port: u16) -> Option<TunnelState>;
}

/// Supervision tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A process surviving this long is considered connected
    pub settle_time: Duration,
    /// A connection that stayed up this long resets the backoff
    pub stable_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            settle_time: Duration::from_secs(3),
            stable_after: Duration::from_secs(60),
        }
    }
}

struct TunnelHandle {
    state: TunnelState,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type Handles = Arc<RwLock<HashMap<u16, TunnelHandle>>>;

/// Supervises one outbound connection per assigned port
pub struct TunnelSupervisor {
    launcher: Arc<dyn ConnectionLauncher>,
    config: SupervisorConfig,
    tunnels: Handles,
}

impl TunnelSupervisor {
    pub fn new(launcher: Arc<dyn ConnectionLauncher>) -> Self {
        Self::with_config(launcher, SupervisorConfig::default())
    }

    pub fn with_config(launcher: Arc<dyn ConnectionLauncher>, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            config,
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start supervising `spec.port`.
    ///
    /// Returns `Ok(false)` when a supervision loop for the port is already
    /// running; a stopped handle is replaced by a fresh loop.
    pub async fn start(&self, spec: TunnelSpec) -> Result<bool, TunnelError> {
        spec.validate()?;
        let port = spec.port;

        let mut tunnels = self.tunnels.write().await;
        if let Some(existing) = tunnels.get(&port) {
            if existing.state != TunnelState::Stopped && !existing.task.is_finished() {
                info!(port, state = ?existing.state, "Tunnel already supervised");
                return Ok(false);
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_tunnel(
            spec,
            self.launcher.clone(),
            self.config.clone(),
            self.tunnels.clone(),
            cancel_rx,
        ));

        tunnels.insert(
            port,
            TunnelHandle {
                state: TunnelState::Starting,
                cancel_tx,
                task,
            },
        );

        info!(port, "Tunnel supervision started");
        Ok(true)
    }

    /// Ports with a handle (running or stopped)
    pub async fn ports(&self) -> Vec<u16> {
        let tunnels = self.tunnels.read().await;
        let mut ports: Vec<u16> = tunnels.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop every supervised tunnel
    pub async fn stop_all(&self) {
        let mut tunnels = self.tunnels.write().await;
        for (port, handle) in tunnels.iter_mut() {
            if handle.state != TunnelState::Stopped {
                info!(port, "Stopping tunnel");
            }
            let _ = handle.cancel_tx.send(true);
            handle.task.abort();
            handle.state = TunnelState::Stopped;
        }
    }
}

#[async_trait]
impl TunnelControl for TunnelSupervisor {
    async fn stop(&self, port: u16) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().await;

        match tunnels.get_mut(&port) {
            Some(handle) => {
                if handle.state != TunnelState::Stopped {
                    info!(port, "Stopping tunnel");
                }
                let _ = handle.cancel_tx.send(true);
                // The process is spawned with kill_on_drop, aborting the
                // task kills it even if the loop is mid-backoff.
                handle.task.abort();
                handle.state = TunnelState::Stopped;
            }
            None => {
                info!(port, "Stop requested for unsupervised port");
            }
        }

        Ok(())
    }

    async fn state(&self, port: u16) -> Option<TunnelState> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(&port).map(|h| h.state)
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        if let Ok(tunnels) = self.tunnels.try_read() {
            for handle in tunnels.values() {
                handle.task.abort();
            }
        }
    }
}

async fn update_state(tunnels: &Handles, port: u16, state: TunnelState) {
    let mut tunnels = tunnels.write().await;
    if let Some(handle) = tunnels.get_mut(&port) {
        // A stop that raced with this update wins
        if handle.state != TunnelState::Stopped {
            handle.state = state;
        }
    }
}

/// Wait for cancellation; resolves immediately if already cancelled
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    while !*cancel_rx.borrow() {
        if cancel_rx.changed().await.is_err() {
            // Sender dropped: treat as cancellation
            return;
        }
    }
}

/// Supervision loop for a single port, never gives up on its own
async fn run_tunnel(
    spec: TunnelSpec,
    launcher: Arc<dyn ConnectionLauncher>,
    config: SupervisorConfig,
    tunnels: Handles,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let port = spec.port;
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
    let mut failures = 0u32;

    loop {
        if failures > 0 {
            let delay = backoff.next_delay();
            info!(
                port,
                attempt = failures,
                "Waiting {:?} before reconnecting",
                delay
            );
            update_state(
                &tunnels,
                port,
                TunnelState::Reconnecting { attempt: failures },
            )
            .await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut cancel_rx) => break,
            }
        }

        if *cancel_rx.borrow() {
            break;
        }

        info!(port, attempt = failures + 1, "Connecting tunnel");

        let mut process = match launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                if e.is_non_recoverable() {
                    error!(port, "Tunnel launch failed, will keep retrying: {}", e);
                } else {
                    warn!(port, "Tunnel launch failed: {}", e);
                }
                failures += 1;
                continue;
            }
        };

        let launched_at = Instant::now();

        // Phase 1: the process must survive the settle window to count as connected
        let early_exit = tokio::select! {
            result = process.wait() => Some(result),
            _ = tokio::time::sleep(config.settle_time) => None,
            _ = cancelled(&mut cancel_rx) => {
                process.kill().await;
                break;
            }
        };

        let result = match early_exit {
            Some(result) => result,
            None => {
                info!(port, "Tunnel connected");
                update_state(&tunnels, port, TunnelState::Connected).await;

                tokio::select! {
                    result = process.wait() => result,
                    _ = cancelled(&mut cancel_rx) => {
                        process.kill().await;
                        break;
                    }
                }
            }
        };

        match result {
            Ok(()) => info!(port, "Tunnel process exited"),
            Err(e) => warn!(port, "Tunnel dropped: {}", e),
        }

        if launched_at.elapsed() >= config.stable_after {
            backoff.reset();
            failures = 0;
        }
        failures += 1;
    }

    info!(port, "Tunnel supervision ended");
    update_state(&tunnels, port, TunnelState::Stopped).await;
}
