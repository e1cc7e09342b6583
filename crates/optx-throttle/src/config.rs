//! Rate controller configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ThrottleError, ThrottleResult};

/// Admission limits for the rolling transaction window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum transactions per window.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Share of `limit` that brand-new orders may use.
    #[serde(default = "default_new_order_fraction")]
    pub new_order_fraction: f64,
    /// Slots kept free for `use_reserve` callers (cancels on shutdown, hedges).
    #[serde(default = "default_reserve_slots")]
    pub reserve_slots: u32,
    /// How long only market makers are admitted after recovering from LimitExceeded.
    #[serde(default = "default_mm_only_delay_ms")]
    pub mm_only_delay_ms: u64,
    /// Penalty assumed when the exchange reports a violation without a duration.
    #[serde(default = "default_penalty_ms")]
    pub default_penalty_ms: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_limit() -> u32 {
    50
}

fn default_new_order_fraction() -> f64 {
    0.5
}

fn default_reserve_slots() -> u32 {
    2
}

fn default_mm_only_delay_ms() -> u64 {
    500
}

fn default_penalty_ms() -> u64 {
    1000
}

fn default_window_ms() -> u64 {
    1000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            new_order_fraction: default_new_order_fraction(),
            reserve_slots: default_reserve_slots(),
            mm_only_delay_ms: default_mm_only_delay_ms(),
            default_penalty_ms: default_penalty_ms(),
            window_ms: default_window_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> ThrottleResult<()> {
        if self.limit == 0 {
            return Err(ThrottleError::InvalidConfig("limit must be > 0".into()));
        }
        if !(self.new_order_fraction > 0.0 && self.new_order_fraction <= 1.0) {
            return Err(ThrottleError::InvalidConfig(format!(
                "new_order_fraction must be in (0, 1], got {}",
                self.new_order_fraction
            )));
        }
        if self.reserve_slots >= self.limit {
            return Err(ThrottleError::InvalidConfig(format!(
                "reserve_slots ({}) must be below limit ({})",
                self.reserve_slots, self.limit
            )));
        }
        if self.window_ms == 0 {
            return Err(ThrottleError::InvalidConfig("window_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Number of NewOrder transactions allowed per window (at least 1).
    pub fn new_order_limit(&self) -> usize {
        ((f64::from(self.limit) * self.new_order_fraction).floor() as usize).max(1)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn default_penalty(&self) -> Duration {
        Duration::from_millis(self.default_penalty_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.new_order_limit(), 25);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ControllerConfig = toml::from_str("limit = 10\nreserve_slots = 0").unwrap();

        assert_eq!(config.limit, 10);
        assert_eq!(config.reserve_slots, 0);
        assert_eq!(config.window_ms, 1000);
        assert_eq!(config.new_order_limit(), 5);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let reserve_too_big = ControllerConfig {
            limit: 5,
            reserve_slots: 5,
            ..Default::default()
        };
        assert!(reserve_too_big.validate().is_err());

        let bad_fraction = ControllerConfig {
            new_order_fraction: 1.5,
            ..Default::default()
        };
        assert!(bad_fraction.validate().is_err());

        let zero_limit = ControllerConfig {
            limit: 0,
            reserve_slots: 0,
            ..Default::default()
        };
        assert!(zero_limit.validate().is_err());
    }
}
