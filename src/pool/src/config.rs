use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Error;

pub const DEFAULT_MIN_IDLE: usize = 2;
pub const DEFAULT_MAX_IDLE: usize = 5;
pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_RECONCILE_INTERVAL: u64 = 120;
pub const DEFAULT_JITTER: f64 = 0.2;
pub const DEFAULT_VALIDATE_INTERVAL: u64 = 300;
pub const DEFAULT_CALL_TIMEOUT: u64 = 30;
pub const DEFAULT_BACKOFF_INITIAL: u64 = 5;
pub const DEFAULT_BACKOFF_MAX: u64 = 300;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_BACKLOG_CAPACITY: usize = 10;
pub const DEFAULT_RESULT_CAPACITY: usize = 64;
pub const DEFAULT_MAX_UNITS: usize = 4;
pub const DEFAULT_MAX_IPS_PER_UNIT: usize = 10;

/// Pool sizing and timing. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_idle: usize,
    pub capacity: usize,
    pub reconcile_interval: u64,
    /// Fraction of `reconcile_interval` added as random jitter, in `[0, 1]`.
    pub jitter: f64,
    pub validate_interval: u64,
    pub call_timeout: u64,
    pub backoff_initial: u64,
    pub backoff_max: u64,
    pub max_in_flight: usize,
    pub backlog_capacity: usize,
    pub result_capacity: usize,
    pub max_units: usize,
    pub max_ips_per_unit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_idle: DEFAULT_MIN_IDLE,
            max_idle: DEFAULT_MAX_IDLE,
            capacity: DEFAULT_CAPACITY,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            jitter: DEFAULT_JITTER,
            validate_interval: DEFAULT_VALIDATE_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            result_capacity: DEFAULT_RESULT_CAPACITY,
            max_units: DEFAULT_MAX_UNITS,
            max_ips_per_unit: DEFAULT_MAX_IPS_PER_UNIT,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_idle > self.max_idle {
            return Err(Error::InvalidState(format!(
                "min_idle({}) must not exceed max_idle({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.max_idle > self.capacity {
            return Err(Error::InvalidState(format!(
                "max_idle({}) must not exceed capacity({})",
                self.max_idle, self.capacity
            )));
        }
        for (name, value) in [
            ("max_in_flight", self.max_in_flight),
            ("backlog_capacity", self.backlog_capacity),
            ("result_capacity", self.result_capacity),
            ("max_ips_per_unit", self.max_ips_per_unit),
        ] {
            if value == 0 {
                return Err(Error::InvalidState(format!("{name} must be positive")));
            }
        }
        if self.reconcile_interval == 0 {
            return Err(Error::InvalidState(
                "reconcile_interval must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidState(format!(
                "jitter({}) must be within [0, 1]",
                self.jitter
            )));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(Error::InvalidState(format!(
                "backoff_initial({}) must not exceed backoff_max({})",
                self.backoff_initial, self.backoff_max
            )));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval)
    }

    pub fn validate_interval(&self) -> Duration {
        Duration::from_secs(self.validate_interval)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.backoff_initial)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn works_default_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[rstest(
        min_idle,
        max_idle,
        capacity,
        valid,
        case(1, 2, 4, true),
        case(0, 0, 0, true),
        case(2, 2, 2, true),
        case(3, 2, 4, false),
        case(1, 5, 4, false),
    )]
    fn works_validate_sizes(min_idle: usize, max_idle: usize, capacity: usize, valid: bool) {
        let conf = PoolConfig {
            min_idle,
            max_idle,
            capacity,
            ..Default::default()
        };
        assert_eq!(conf.validate().is_ok(), valid);
    }

    #[test]
    fn fails_zero_channel_capacity() {
        let conf = PoolConfig {
            backlog_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(Error::InvalidState(_))));
    }
}
