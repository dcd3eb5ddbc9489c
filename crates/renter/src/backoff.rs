use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::duration_secs;
use crate::error::RetryError;

/// Exponential backoff bounded by a total elapsed-time budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "duration_secs")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
    /// Once this much time has passed since the first attempt no further attempt is scheduled.
    #[serde(with = "duration_secs")]
    pub max_elapsed: Duration,
    /// Delays are drawn from `interval * [1 - f, 1 + f]`.
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            multiplier: 1.5,
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(5 * 60),
            randomization_factor: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        let secs = (current.as_secs_f64() * self.multiplier.max(1.0))
            .min(self.max_interval.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if !(factor > 0.0) {
            return interval;
        }
        let base = interval.as_secs_f64();
        let delta = base * factor;
        let (low, high) = ((base - delta).max(0.0), base + delta);
        if !high.is_finite() || low >= high {
            return interval;
        }
        let secs = rand::thread_rng().gen_range(low..=high);
        Duration::try_from_secs_f64(secs).unwrap_or(interval)
    }
}

/// Runs `op` until it succeeds, the policy's elapsed budget is spent, or `cancel` fires
/// while waiting between attempts. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let start = Instant::now();
    let mut interval = policy.initial_interval;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match op(attempts).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = policy.jittered(interval);
        if start.elapsed() + delay > policy.max_elapsed {
            return Err(RetryError::Exhausted {
                max_elapsed: policy.max_elapsed,
                attempts,
                last: err,
            });
        }
        debug!(attempts, delay_ms = delay.as_millis() as u64, error = %err, "Backing off before retry");

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        interval = policy.next_interval(interval);
    }
}
