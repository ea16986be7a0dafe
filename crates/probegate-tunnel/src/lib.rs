//! Tunnel supervision for probes
//!
//! Each probe keeps exactly one outbound reverse tunnel to the proxy, bound to
//! the port it was assigned. The supervisor owns the connection process for a
//! port, restarts it with capped exponential backoff, and exposes a stop/state
//! hook used by the lifecycle controller's kill switch and heartbeat.

pub mod backoff;
pub mod launcher;
pub mod supervisor;
pub mod systemd;

pub use backoff::Backoff;
pub use launcher::{
    ConnectionLauncher, ProxyEndpoint, SshLauncher, TunnelCredentials, TunnelError,
    TunnelProcess, TunnelSpec,
};
pub use supervisor::{SupervisorConfig, TunnelControl, TunnelState, TunnelSupervisor};
pub use systemd::{SystemdInstaller, SystemdUnit};
