//! Retry with full jitter.
//!
//! Between attempts the helper sleeps a uniform random duration inside the
//! configured window. Rate-limit errors are handled out of band: the server
//! already told us how long to wait, so we sleep exactly that and the attempt
//! is not charged against the budget.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay_secs: f64, max_delay_secs: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay_secs,
            max_delay_secs: max_delay_secs.max(min_delay_secs),
        }
    }

    fn jitter(&self) -> Duration {
        let secs = if self.max_delay_secs > self.min_delay_secs {
            rand::thread_rng().gen_range(self.min_delay_secs..=self.max_delay_secs)
        } else {
            self.min_delay_secs
        };
        Duration::from_secs_f64(secs)
    }
}

impl From<&config::Retry> for RetryPolicy {
    fn from(cfg: &config::Retry) -> Self {
        Self::new(cfg.max_attempts, cfg.min_delay_secs, cfg.max_delay_secs)
    }
}

/// Run `op` until it succeeds, the error is not retryable, or the attempt
/// budget runs out. The last error is surfaced.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::RateLimited { seconds }) => {
                warn!(seconds, "rate limited, waiting");
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(attempt, error = %err, "retry budget exhausted");
                    return Err(err);
                }
                let delay = policy.jitter();
                debug!(attempt, ?delay, error = %err, "retrying after delay");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
