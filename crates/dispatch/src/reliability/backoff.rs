//! Exponential backoff state machine

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError};

/// Bounds of an exponential backoff
///
/// # Example
///
/// ```
/// use taskmesh_dispatch::BackoffConfig;
/// use std::time::Duration;
///
/// let config = BackoffConfig::default()
///     .with_min_interval(Duration::from_millis(50))
///     .with_max_interval(Duration::from_secs(2));
///
/// // 50ms, 100ms, 200ms, ... capped at 2s
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Interval after a productive run
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Ceiling for the interval
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor applied after each idle run
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    /// 100ms minimum, doubling, 10s ceiling
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Create a config with explicit bounds
    pub fn new(min_interval: Duration, max_interval: Duration, multiplier: f64) -> Self {
        Self {
            min_interval,
            max_interval,
            multiplier,
        }
    }

    /// Set the minimum interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set the interval ceiling
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the growth factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Check that the bounds describe a usable backoff
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "backoff min_interval must be greater than zero".into(),
            ));
        }
        if self.max_interval < self.min_interval {
            return Err(ConfigError::Invalid(format!(
                "backoff max_interval ({:?}) is below min_interval ({:?})",
                self.max_interval, self.min_interval
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Current interval of an exponential backoff
///
/// Starts at the minimum. [`increase`](Self::increase) multiplies the
/// interval up to the ceiling, [`reset`](Self::reset) returns to the minimum.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.min_interval;
        Self { config, current }
    }

    /// Interval to wait before the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Return to the minimum interval
    pub fn reset(&mut self) {
        self.current = self.config.min_interval;
    }

    /// Grow the interval, capped at the ceiling, and return the new value
    pub fn increase(&mut self) -> Duration {
        let next_nanos = (self.current.as_nanos() as f64 * self.config.multiplier).round();
        let ceiling_nanos = self.config.max_interval.as_nanos() as f64;
        let capped = next_nanos.min(ceiling_nanos) as u64;
        self.current = Duration::from_nanos(capped).max(self.config.min_interval);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.multiplier, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_doubles_until_ceiling() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.current(), Duration::from_millis(100));

        let observed: Vec<u128> = (0..9).map(|_| backoff.increase().as_millis()).collect();
        assert_eq!(
            observed,
            vec![200, 400, 800, 1600, 3200, 6400, 10_000, 10_000, 10_000]
        );
    }

    #[test]
    fn test_reset_returns_to_minimum() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.increase();
        backoff.increase();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_multiplier_of_one_is_fixed_interval() {
        let mut backoff = Backoff::new(BackoffConfig::default().with_multiplier(1.0));
        assert_eq!(backoff.increase(), Duration::from_millis(100));
        assert_eq!(backoff.increase(), Duration::from_millis(100));
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        assert!(BackoffConfig::default()
            .with_min_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BackoffConfig::default()
            .with_max_interval(Duration::from_millis(10))
            .validate()
            .is_err());
        assert!(BackoffConfig::default()
            .with_multiplier(0.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serialization() {
        let config = BackoffConfig::default().with_multiplier(3.0);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["min_interval"], 100);
        assert_eq!(json["max_interval"], 10_000);

        let parsed: BackoffConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
