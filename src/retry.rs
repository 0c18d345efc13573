//! Reconnect backoff policy.
//!
//! This module provides the [`Backoff`] type shared by the connection state
//! machine and channel resources. Unlike request-level retry, reconnects never
//! give up on their own: the interval simply grows in fixed steps until it
//! reaches the ceiling and stays there.
//!
//! # Retry Strategy
//!
//! - The first retry after a healthy period happens immediately (0ms)
//! - Each further failure adds one `step` (100ms by default)
//! - The interval is capped at `max` (5000ms by default)
//! - A successful acquire resets the interval to zero

use std::time::Duration;

use serde::Deserialize;

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Amount added to the interval after each failed attempt.
    #[serde(with = "millis")]
    pub step: Duration,

    /// Upper bound of the interval.
    #[serde(with = "millis")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    /// - `step`: 100ms
    /// - `max`: 5s
    fn default() -> Self {
        // ---
        Self {
            step: Duration::from_millis(100),
            max: Duration::from_millis(5000),
        }
    }
}

/// Stateful bounded backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        // ---
        Self {
            config,
            current: Duration::ZERO,
        }
    }

    /// Interval to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the interval to wait now and grow it for the attempt after.
    pub fn next_delay(&mut self) -> Duration {
        // ---
        let delay = self.current;
        self.current = (self.current + self.config.step).min(self.config.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Serde adapter: durations as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        // ---
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            // ---
            let ms = Option::<u64>::deserialize(deserializer)?;
            Ok(ms.map(Duration::from_millis))
        }
    }
}
