//! Adaptive polling interval.
//!
//! Snaps back to the minimum whenever something changed and grows
//! geometrically toward the maximum while nothing does. The same type
//! doubles as the backoff schedule for host-call retries.

use std::time::Duration;

use crate::config::PollingConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveInterval {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            factor: factor.max(1.0),
            current: min,
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(
            config.min_interval(),
            config.max_interval(),
            config.growth_factor,
        )
    }

    /// Doubling backoff starting at `base`, capped at `cap`.
    pub fn backoff(base: Duration, cap: Duration) -> Self {
        Self::new(base, cap, 2.0)
    }

    /// Resume from a previously computed interval, clamped to the bounds.
    pub fn starting_at(mut self, current: Duration) -> Self {
        self.current = current.clamp(self.min, self.max);
        self
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn reset(&mut self) -> Duration {
        self.current = self.min;
        self.current
    }

    pub fn grow(&mut self) -> Duration {
        let next = self.current.as_secs_f64() * self.factor;
        self.current = Duration::from_secs_f64(next.min(self.max.as_secs_f64())).max(self.min);
        self.current
    }

    /// Advance one poll: reset on change, otherwise grow.
    pub fn advance(&mut self, changed: bool) -> Duration {
        if changed {
            self.reset()
        } else {
            self.grow()
        }
    }
}
