//! Reachability probes used by the heartbeat sweep

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::ProbeError;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Check whether the tunnel behind `port` answers
    async fn probe(&self, port: u16) -> Result<(), ProbeError>;
}

/// TCP connect to `<host>:<port>` on the proxy
#[derive(Debug, Clone)]
pub struct TcpProber {
    host: String,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, port: u16) -> Result<(), ProbeError> {
        let addr = format!("{}:{}", self.host, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Unreachable {
                port,
                reason: e.to_string(),
            }),
            Err(_) => Err(ProbeError::Timeout { port }),
        }
    }
}
