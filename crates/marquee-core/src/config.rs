use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::health::HealthConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::partial::PartialResultConfig;
use crate::retry::SchedulerConfig;

/// Configuration for every engine component.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub partial: PartialResultConfig,
}

impl EngineConfig {
    /// Read configuration from `MARQUEE_*` environment variables.
    ///
    /// Every variable is optional; unset ones keep their defaults.
    ///
    /// - `MARQUEE_BREAKER_FAILURE_THRESHOLD`, `MARQUEE_BREAKER_SUCCESS_THRESHOLD`,
    ///   `MARQUEE_BREAKER_OPEN_TIMEOUT_SECS`
    /// - `MARQUEE_PROVIDER_TIMEOUT_SECS`, `MARQUEE_FAILURE_DELAY_MS`,
    ///   `MARQUEE_MAX_KEYWORD_VARIANTS`, `MARQUEE_MIN_CONFIDENCE`
    /// - `MARQUEE_BACKOFF_BASE_SECS`, `MARQUEE_BACKOFF_MAX_SECS`,
    ///   `MARQUEE_BACKOFF_MULTIPLIER`
    /// - `MARQUEE_RETRY_MAX_ATTEMPTS`, `MARQUEE_RETRY_INTERVAL_SECS`,
    ///   `MARQUEE_RETRY_BATCH_SIZE`
    /// - `MARQUEE_HEALTH_DEGRADED_AFTER`, `MARQUEE_HEALTH_DOWN_AFTER`,
    ///   `MARQUEE_HEALTH_RECOVER_AFTER`, `MARQUEE_HEALTH_INTERVAL_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let env = Env(lookup);
        let mut config = Self::default();

        let breaker = &mut config.orchestrator.breaker;
        if let Some(n) = env.positive("MARQUEE_BREAKER_FAILURE_THRESHOLD")? {
            breaker.failure_threshold = n;
        }
        if let Some(n) = env.positive("MARQUEE_BREAKER_SUCCESS_THRESHOLD")? {
            breaker.success_threshold = n;
        }
        if let Some(secs) = env.parse::<u64>("MARQUEE_BREAKER_OPEN_TIMEOUT_SECS")? {
            breaker.open_timeout = Duration::from_secs(secs);
            breaker.max_open_timeout = breaker.max_open_timeout.max(breaker.open_timeout);
        }

        let orchestrator = &mut config.orchestrator;
        if let Some(secs) = env.positive::<u64>("MARQUEE_PROVIDER_TIMEOUT_SECS")? {
            orchestrator.provider_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse::<u64>("MARQUEE_FAILURE_DELAY_MS")? {
            orchestrator.failure_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse::<usize>("MARQUEE_MAX_KEYWORD_VARIANTS")? {
            orchestrator.max_keyword_variants = n;
        }
        if let Some(min) = env.parse::<f64>("MARQUEE_MIN_CONFIDENCE")? {
            if !(0.0..=1.0).contains(&min) {
                return Err(AppError::ConfigError(format!(
                    "MARQUEE_MIN_CONFIDENCE must be between 0 and 1, got {min}"
                )));
            }
            orchestrator.min_confidence = min;
        }

        let backoff = &mut config.scheduler.backoff;
        if let Some(secs) = env.parse::<u64>("MARQUEE_BACKOFF_BASE_SECS")? {
            backoff.base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("MARQUEE_BACKOFF_MAX_SECS")? {
            backoff.max_delay = Duration::from_secs(secs);
        }
        if let Some(m) = env.parse::<f64>("MARQUEE_BACKOFF_MULTIPLIER")? {
            if !m.is_finite() || m < 1.0 {
                return Err(AppError::ConfigError(format!(
                    "MARQUEE_BACKOFF_MULTIPLIER must be at least 1.0, got {m}"
                )));
            }
            backoff.multiplier = m;
        }
        if backoff.max_delay < backoff.base_delay {
            return Err(AppError::ConfigError(
                "MARQUEE_BACKOFF_MAX_SECS must not be below MARQUEE_BACKOFF_BASE_SECS".into(),
            ));
        }

        let scheduler = &mut config.scheduler;
        if let Some(n) = env.positive("MARQUEE_RETRY_MAX_ATTEMPTS")? {
            scheduler.max_attempts = n;
        }
        if let Some(secs) = env.positive::<u64>("MARQUEE_RETRY_INTERVAL_SECS")? {
            scheduler.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env.positive("MARQUEE_RETRY_BATCH_SIZE")? {
            scheduler.batch_size = n;
        }

        let health = &mut config.health;
        if let Some(n) = env.positive("MARQUEE_HEALTH_DEGRADED_AFTER")? {
            health.degraded_after = n;
        }
        if let Some(n) = env.positive("MARQUEE_HEALTH_DOWN_AFTER")? {
            health.down_after = n;
        }
        if let Some(n) = env.positive("MARQUEE_HEALTH_RECOVER_AFTER")? {
            health.recover_after = n;
        }
        if let Some(secs) = env.positive::<u64>("MARQUEE_HEALTH_INTERVAL_SECS")? {
            health.check_interval = Duration::from_secs(secs);
        }
        if health.down_after < health.degraded_after {
            return Err(AppError::ConfigError(
                "MARQUEE_HEALTH_DOWN_AFTER must not be below MARQUEE_HEALTH_DEGRADED_AFTER".into(),
            ));
        }

        Ok(config)
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, AppError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'"))),
        }
    }

    fn positive<T>(&self, key: &str) -> Result<Option<T>, AppError>
    where
        T: FromStr + PartialOrd + Default,
    {
        match self.parse::<T>(key)? {
            Some(v) if v <= T::default() => Err(AppError::ConfigError(format!(
                "{key} must be greater than zero"
            ))),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<EngineConfig, AppError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.orchestrator.breaker.failure_threshold, 5);
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.scheduler.backoff.base_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MARQUEE_BREAKER_FAILURE_THRESHOLD", "3"),
            ("MARQUEE_PROVIDER_TIMEOUT_SECS", "8"),
            ("MARQUEE_MIN_CONFIDENCE", "0.5"),
            ("MARQUEE_BACKOFF_BASE_SECS", "10"),
            ("MARQUEE_BACKOFF_MULTIPLIER", "3"),
            ("MARQUEE_RETRY_MAX_ATTEMPTS", "7"),
            ("MARQUEE_HEALTH_DOWN_AFTER", "9"),
        ])
        .unwrap();

        assert_eq!(config.orchestrator.breaker.failure_threshold, 3);
        assert_eq!(config.orchestrator.provider_timeout, Duration::from_secs(8));
        assert_eq!(config.orchestrator.min_confidence, 0.5);
        assert_eq!(config.scheduler.backoff.base_delay, Duration::from_secs(10));
        assert_eq!(config.scheduler.backoff.multiplier, 3.0);
        assert_eq!(config.scheduler.max_attempts, 7);
        assert_eq!(config.health.down_after, 9);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = load(&[("MARQUEE_RETRY_MAX_ATTEMPTS", "many")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        assert!(load(&[("MARQUEE_BREAKER_FAILURE_THRESHOLD", "0")]).is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let vars = [
            ("MARQUEE_BACKOFF_BASE_SECS", "600"),
            ("MARQUEE_BACKOFF_MAX_SECS", "60"),
        ];
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_confidence() {
        assert!(load(&[("MARQUEE_MIN_CONFIDENCE", "1.5")]).is_err());
    }

    #[test]
    fn test_blank_value_keeps_default() {
        let config = load(&[("MARQUEE_RETRY_BATCH_SIZE", "  ")]).unwrap();
        assert_eq!(config.scheduler.batch_size, 50);
    }
}
