//! HTTP clients for the gatekeeper and the registration trigger

use async_trait::async_trait;
use probegate_proto::{MacAddress, RegistrationNotice, RequestPortResponse};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::BootstrapError;

/// Talks to the Port Allocation Service
#[async_trait]
pub trait PortClient: Send + Sync {
    async fn request_port(&self, mac: &MacAddress) -> Result<RequestPortResponse, BootstrapError>;
}

/// Hands the probe over to the automation controller
#[async_trait]
pub trait RegistrationTrigger: Send + Sync {
    /// Deliver one notice. Receivers must tolerate duplicates.
    async fn notify(&self, notice: &RegistrationNotice) -> Result<(), BootstrapError>;
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, BootstrapError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("probe-bootstrap/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| BootstrapError::Fatal(format!("Failed to build HTTP client: {}", e)))
}

/// 5xx and 429 are worth retrying; other errors need a human
fn classify_status(status: StatusCode, body: &str, what: &str) -> BootstrapError {
    let message = format!("{} returned {}: {}", what, status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BootstrapError::Retryable(message)
    } else {
        BootstrapError::Fatal(message)
    }
}

fn transport_error(err: reqwest::Error, what: &str) -> BootstrapError {
    if err.is_builder() {
        BootstrapError::Fatal(format!("{}: invalid request: {}", what, err))
    } else {
        BootstrapError::Retryable(format!("{}: {}", what, err))
    }
}

#[derive(Debug, Clone)]
pub struct HttpPortClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPortClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BootstrapError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PortClient for HttpPortClient {
    async fn request_port(&self, mac: &MacAddress) -> Result<RequestPortResponse, BootstrapError> {
        let url = format!("{}/provision/request-port", self.base_url);
        debug!(%url, mac = %mac, "Requesting proxy port");

        let response = self
            .client
            .get(&url)
            .query(&[("mac", mac.to_string())])
            .send()
            .await
            .map_err(|e| transport_error(e, "gatekeeper"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, "gatekeeper"));
        }

        let assignment: RequestPortResponse = response
            .json()
            .await
            .map_err(|e| BootstrapError::Retryable(format!("Invalid gatekeeper response: {}", e)))?;

        if assignment.port == 0 || assignment.mac != *mac {
            return Err(BootstrapError::Retryable(format!(
                "Gatekeeper answered port {} for {}",
                assignment.port, assignment.mac
            )));
        }

        info!(port = assignment.port, status = ?assignment.status, "Assigned proxy port");
        Ok(assignment)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRegistrationTrigger {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrationTrigger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BootstrapError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RegistrationTrigger for HttpRegistrationTrigger {
    async fn notify(&self, notice: &RegistrationNotice) -> Result<(), BootstrapError> {
        info!(url = %self.url, port = notice.port, "Calling registration trigger");

        let response = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| transport_error(e, "registration trigger"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, "registration trigger"));
        }

        info!("Registration trigger accepted notice");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "", "x").is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "", "x").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "", "x").is_retryable());
        assert!(!classify_status(StatusCode::NOT_FOUND, "", "x").is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_gatekeeper_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HttpPortClient::new(format!("http://127.0.0.1:{}", port), Duration::from_secs(2)).unwrap();
        let err = client
            .request_port(&"aa:bb:cc:dd:ee:ff".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
