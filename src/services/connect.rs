use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Fixed-backoff, bounded retry for connecting to remote services at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Call `connect` until it succeeds or `policy.max_attempts` is used up,
/// sleeping `policy.backoff` between attempts. The last error is returned.
pub async fn connect_with_retry<T, E, F, Fut>(
    target: &str,
    policy: RetryPolicy,
    mut connect: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match connect().await {
            Ok(connection) => {
                tracing::info!(service = %target, attempt, "Connected");
                return Ok(connection);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(service = %target, attempt, error = %e, "Giving up connecting");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    service = %target,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Connection failed, retrying"
                );
                sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}
