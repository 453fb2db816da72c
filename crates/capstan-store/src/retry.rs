//! Bounded retry with exponential backoff and jitter.
//!
//! Fail-fast tuning: the blob store guarantees read-after-write, so a
//! read that still fails after three short attempts is a real fault, not
//! eventual consistency. Jitter spreads concurrent retries so they do
//! not land in lockstep.

use capstan_core::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: exponential, capped, ±10% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(-0.1f64..=0.1f64);
        let millis = (exp.as_millis() as f64 * (1.0 + jitter)).max(1.0);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Run `op` up to `policy.attempts` times, sleeping between failures.
/// Returns the last error when every attempt fails.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < policy.attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}
