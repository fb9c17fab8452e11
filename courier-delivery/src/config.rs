//! Dispatcher tuning

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ReconnectPolicy;

/// Configuration for a [`Dispatcher`](crate::Dispatcher)
///
/// Every field has a default, so an empty configuration is valid:
///
/// ```text
/// (
///     chunk_size: 10,
///     chunk_delay_secs: 600,
///     reconnect: (max_attempts: 10),
/// )
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of messages sent over one connection before pausing
    ///
    /// Default: 10
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: usize,

    /// Cooldown between consecutive chunks of the same batch (in seconds)
    ///
    /// Never applied after the final chunk.
    ///
    /// Default: 600 seconds (10 minutes)
    #[serde(default = "defaults::chunk_delay_secs")]
    pub chunk_delay_secs: u64,

    /// Number of batches that may wait in the intake queue
    ///
    /// Default: 16
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// How long shutdown waits for in-flight batches to wind down (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Connection establishment retry policy
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::chunk_size(),
            chunk_delay_secs: defaults::chunk_delay_secs(),
            queue_capacity: defaults::queue_capacity(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub const fn chunk_delay(&self) -> Duration {
        Duration::from_secs(self.chunk_delay_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

mod defaults {
    pub const fn chunk_size() -> usize {
        10
    }

    pub const fn chunk_delay_secs() -> u64 {
        600 // 10 minutes
    }

    pub const fn queue_capacity() -> usize {
        16
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}
