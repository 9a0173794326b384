use std::time::Duration;

use chrono::TimeDelta;

/// Exponential backoff parameters for deferred retries.
///
/// Default schedule: 30s, 1m, 2m, 4m, ... capped at 1h.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

/// Computes the delay before the next retry attempt.
///
/// Pure and deterministic: `calculate(0)` is the base delay, later attempts
/// grow by `multiplier` and never exceed `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        // A multiplier below 1 would make the schedule shrink.
        let config = BackoffConfig {
            multiplier: if config.multiplier.is_finite() {
                config.multiplier.max(1.0)
            } else {
                1.0
            },
            ..config
        };
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn calculate(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.min(self.config.max_delay);
        if attempt == 0 {
            return base;
        }

        let factor = self.config.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs).clamp(base, self.config.max_delay)
    }

    /// Same as [`calculate`](Self::calculate), as a chrono delta for timestamp math.
    pub fn delta(&self, attempt: u32) -> TimeDelta {
        TimeDelta::from_std(self.calculate(attempt)).unwrap_or(TimeDelta::MAX)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
