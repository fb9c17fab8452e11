//! Connection establishment with bounded retries

use std::time::Duration;

use courier_common::outgoing;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::DeliveryError,
    transport::{Connection, Opener},
};

/// How hard to try when dialing an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Dial attempts before the chunk is failed with
    /// [`DeliveryError::MaxReconnectAttempts`]. Values below 1 behave as 1.
    ///
    /// Default: 10 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff between attempts (in seconds)
    ///
    /// The delay before attempt `n + 1` is `base * 2^(n - 1)`. Zero retries
    /// immediately.
    ///
    /// Default: 1 second
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Maximum delay between attempts (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Jitter factor for randomizing the delay, clamped to `0.0..=1.0`
    ///
    /// Default: 0.2 (±20%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl ReconnectPolicy {
    /// The effective attempt bound.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    ///
    /// `delay = min(base * 2^(attempt - 1), max) * (1 ± jitter)`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = if exponent >= 63 {
            self.max_delay_secs
        } else {
            self.base_delay_secs
                .saturating_mul(1u64 << exponent)
                .min(self.max_delay_secs)
        };

        let jitter_factor = if self.jitter_factor.is_finite() {
            self.jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if delay == 0 || jitter_factor <= 0.0 {
            return Duration::from_secs(delay);
        }

        #[allow(clippy::cast_precision_loss)]
        let delay = delay as f64;
        let jitter_range = delay * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);

        // Jitter can push a near-maximal delay past what a Duration holds.
        Duration::try_from_secs_f64((delay + jitter).max(0.0))
            .unwrap_or(Duration::from_secs(self.max_delay_secs))
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        10
    }

    pub const fn base_delay_secs() -> u64 {
        1
    }

    pub const fn max_delay_secs() -> u64 {
        30
    }

    pub const fn jitter_factor() -> f64 {
        0.2 // ±20%
    }
}

/// Dial `opener` until it yields a connection.
///
/// Returns `Ok(None)` if `cancel` fires before a connection is made: the
/// dial was abandoned, which callers must not confuse with a failure.
///
/// # Errors
///
/// Returns [`DeliveryError::MaxReconnectAttempts`], carrying the last dial
/// error, once `policy.attempts()` dials have failed.
#[tracing::instrument(level = "debug", skip_all, fields(max_attempts = policy.attempts()))]
pub async fn open_with_retry(
    opener: &dyn Opener,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> Result<Option<Box<dyn Connection>>, DeliveryError> {
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            outgoing!(level = DEBUG, "Dial abandoned after {attempts} failed attempts");
            return Ok(None);
        }

        let error = match opener.open().await {
            Ok(connection) => {
                outgoing!("Connected after {attempts} failed attempts");
                return Ok(Some(connection));
            }
            Err(e) => e,
        };

        attempts += 1;
        tracing::warn!(attempt = attempts, error = %error, "Failed to open connection");

        if attempts >= policy.attempts() {
            return Err(DeliveryError::MaxReconnectAttempts {
                attempts,
                last: error,
            });
        }

        let delay = policy.delay_for(attempts);
        if !delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => {
                    outgoing!(level = DEBUG, "Dial abandoned while backing off");
                    return Ok(None);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
