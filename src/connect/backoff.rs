//! Bounded retry with quadratic backoff.
//!
//! After the attempt with zero-based index `i` fails, the caller sleeps for
//! `i² × unit` before trying again. The attempt that pushes the failure count
//! past `max_failures` is terminal, so with the default policy a target that
//! fails six times in a row is given up on without a seventh attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::ConnectError;

/// Retry budget and backoff unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated; one more is fatal.
    pub max_failures: u32,
    /// One backoff time unit.
    #[serde(rename = "unit_ms", with = "millis")]
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_failures: u32, unit: Duration) -> Self {
        Self { max_failures, unit }
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// Suspends the retry loop between attempts. Injectable so tests can record
/// the requested delays instead of waiting them out.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `attempt_fn` until it succeeds or the policy's failure budget is spent.
pub async fn connect_with_backoff<C, E, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    attempt_fn: F,
) -> Result<C, ConnectError>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C, E>>,
{
    connect_with_backoff_using(target, policy, &TokioSleeper, attempt_fn).await
}

/// [`connect_with_backoff`] with an explicit [`Sleeper`].
pub async fn connect_with_backoff_using<C, E, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut attempt_fn: F,
) -> Result<C, ConnectError>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<C, E>>,
{
    let mut failures: u32 = 0;

    loop {
        match attempt_fn().await {
            Ok(conn) => {
                info!(target_addr = %target, attempts = failures + 1, "connected");
                return Ok(conn);
            }
            Err(e) => {
                let attempt = failures;
                failures += 1;
                warn!(target_addr = %target, attempt, error = %e, "connection attempt failed");

                if failures > policy.max_failures {
                    return Err(ConnectError::Exhausted {
                        target: target.to_string(),
                        attempts: failures,
                        last_error: e.to_string(),
                    });
                }

                let delay = policy.delay_after(attempt);
                info!(target_addr = %target, delay_ms = delay.as_millis() as u64, "backing off");
                sleeper.sleep(delay).await;
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
