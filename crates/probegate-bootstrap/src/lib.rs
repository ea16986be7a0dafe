//! Probe-side bootstrap: discover identity, obtain a proxy port, bring up the
//! persistent tunnel and hand the probe over to the automation controller.

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod installer;
pub mod keys;
pub mod mac;
pub mod marker;
pub mod retry;
pub mod tenant;

pub use agent::{BootstrapAgent, BootstrapOutcome, BootstrapSeams, BootstrapSettings, BootstrapState};
pub use client::{HttpPortClient, HttpRegistrationTrigger, PortClient, RegistrationTrigger};
pub use config::{BootstrapConfig, DEFAULT_CONFIG_FILE, DEFAULT_MARKER_PATH};
pub use error::BootstrapError;
pub use installer::{SystemdTunnelInstaller, TunnelInstaller};
pub use keys::{KeyPair, KeyProvider, SshKeygenProvider};
pub use mac::{MacSource, SysfsMacSource};
pub use marker::{CompletionMarker, MarkerRecord};
pub use retry::{with_retry, RetryPolicy};
pub use tenant::TenantIdentity;
