// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry of transient management API failures

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{FleetError, Result};

/// How often a transient failure is retried
///
/// `attempts` counts retries after the first call, so the default of zero
/// makes every call exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub attempts: u32,

    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff that gives up after `attempts` retries
    pub fn backoff(&self) -> BoundedBackoff {
        let initial_interval = Duration::from_millis(self.backoff_ms);
        BoundedBackoff {
            inner: ExponentialBackoff {
                current_interval: initial_interval,
                initial_interval,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: Duration::from_secs(60 * 60),
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
            attempts: self.attempts,
            remaining: self.attempts,
        }
    }
}

/// `ExponentialBackoff` limited to a number of retries
#[derive(Debug, Clone)]
pub struct BoundedBackoff {
    inner: ExponentialBackoff,
    attempts: u32,
    remaining: u32,
}

impl Backoff for BoundedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.remaining = self.attempts;
    }
}

fn classify(error: FleetError) -> backoff::Error<FleetError> {
    if error.is_transient() {
        backoff::Error::transient(error)
    } else {
        backoff::Error::permanent(error)
    }
}

/// Run `call` until it succeeds, fails permanently or runs out of retries
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    backoff::future::retry_notify(
        policy.backoff(),
        || {
            let pending = call();
            async move { pending.await.map_err(classify) }
        },
        |error: FleetError, delay: Duration| {
            attempt += 1;
            warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying");
        },
    )
    .await
}
