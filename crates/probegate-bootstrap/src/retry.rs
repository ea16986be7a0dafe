//! Bounded retry for the network-facing bootstrap steps

use probegate_tunnel::Backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::BootstrapError;

/// Retry budget for a single bootstrap step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    #[serde(with = "secs")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Run `op` until it succeeds, fails fatally or the budget runs out.
///
/// Fatal errors are returned immediately. Exhausting the budget returns the
/// last retryable error with the attempt count attached.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, step: &str, mut op: F) -> Result<T, BootstrapError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BootstrapError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = Backoff::new(policy.initial_delay, policy.max_delay);

    loop {
        let attempt = backoff.attempt() + 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(BootstrapError::Fatal(reason)) => return Err(BootstrapError::Fatal(reason)),
            Err(BootstrapError::Retryable(reason)) => {
                if attempt >= max_attempts {
                    return Err(BootstrapError::Retryable(format!(
                        "{} failed after {} attempts: {}",
                        step, attempt, reason
                    )));
                }
                let delay = backoff.next_delay();
                warn!(
                    step,
                    attempt,
                    max_attempts,
                    "{} failed ({}), retrying in {:?}",
                    step,
                    reason,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
