//! Replication engine settings.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Timing, retry and sizing knobs of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How often the master is polled, in milliseconds
    pub poll_interval_ms: u64,

    /// Drain tick for slave workers when no enqueue wakes them
    pub drain_interval_ms: u64,

    /// Account heartbeat period
    pub heartbeat_interval_ms: u64,

    /// Upper bound on any single broker call
    pub broker_timeout_ms: u64,

    /// Attempts before a retryable failure becomes terminal
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt
    pub retry_base_ms: u64,

    /// Retry delay cap
    pub retry_max_ms: u64,

    /// Lot step used when the broker does not report one
    pub default_lot_step: Decimal,

    /// Copy positions the master already holds when the engine starts
    pub copy_existing_on_startup: bool,

    /// Reconnect disconnected accounts on heartbeat
    pub auto_reconnect: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            drain_interval_ms: 100,
            heartbeat_interval_ms: 10_000,
            broker_timeout_ms: 5_000,
            max_attempts: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            default_lot_step: dec!(0.01),
            copy_existing_on_startup: false,
            auto_reconnect: true,
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    /// Delay before the retry following `attempts` failures:
    /// `min(base * 2^(attempts - 1), max)`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self
            .retry_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_ms);
        Duration::from_millis(delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive".to_string());
        }
        if self.drain_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err("drain and heartbeat intervals must be positive".to_string());
        }
        if self.broker_timeout_ms == 0 {
            return Err("broker_timeout_ms must be positive".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err("retry_base_ms must not exceed retry_max_ms".to_string());
        }
        if self.default_lot_step <= Decimal::ZERO {
            return Err("default_lot_step must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let settings = EngineSettings::default();
        assert_eq!(settings.retry_delay(1), Duration::from_secs(1));
        assert_eq!(settings.retry_delay(2), Duration::from_secs(2));
        assert_eq!(settings.retry_delay(3), Duration::from_secs(4));
        assert_eq!(settings.retry_delay(10), Duration::from_secs(30));
        assert_eq!(settings.retry_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: EngineSettings = toml::from_str("poll_interval_ms = 250").unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.max_attempts, 3);
        assert!(settings.validate().is_ok());

        let bad = EngineSettings {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
