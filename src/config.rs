//! Pool configuration.

use crate::error::{RealtimeError, Result};
use crate::protocol::ProtocolConfig;
use std::time::Duration;

/// Connection pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Reconnect backoff and attempt ceiling.
    pub reconnect: ReconnectPolicy,

    /// Interval between heartbeats while connected.
    /// Default: 30s
    pub heartbeat_interval: Duration,

    /// Worker threads of the shared scheduler.
    /// Default: 2
    pub scheduler_threads: usize,

    /// Handshake timeout for the websocket connector.
    pub connect_timeout: Duration,

    /// Bounded wait used when a pool is dropped without `shutdown()`.
    pub shutdown_timeout: Duration,

    /// Capacity of each connection's inbound message queue.
    pub inbound_buffer: usize,

    /// Wire naming.
    pub protocol: ProtocolConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            scheduler_threads: 2,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            inbound_buffer: 1024,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(RealtimeError::Configuration(format!("{what} must be > 0")));
        if self.scheduler_threads == 0 {
            return invalid("scheduler_threads");
        }
        if self.heartbeat_interval.is_zero() {
            return invalid("heartbeat_interval");
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout");
        }
        if self.inbound_buffer == 0 {
            return invalid("inbound_buffer");
        }
        if self.reconnect.base_delay.is_zero() {
            return invalid("reconnect.base_delay");
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(RealtimeError::Configuration(
                "reconnect.max_delay must be >= reconnect.base_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential reconnect backoff with a ceiling on consecutive attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnects scheduled before the connection gives up and enters
    /// the `Error` state.
    /// Default: 10
    pub max_attempts: u32,

    /// Delay before the first reconnect.
    /// Default: 1s
    pub base_delay: Duration,

    /// Cap on any single delay.
    /// Default: 30s
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based count of consecutive
    /// failures): `min(max_delay, base_delay * 2^(attempt-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Whether a reconnect may still be scheduled for `attempt`.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=9)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30]);
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(1));
        assert!(policy.allows(10));
        assert!(!policy.allows(11));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(PoolConfig::default().validate().is_ok());

        let config = PoolConfig {
            scheduler_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RealtimeError::Configuration(_))));

        let config = PoolConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(attempt in 1u32..200) {
            let policy = ReconnectPolicy::default();
            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(current <= policy.max_delay);
            prop_assert!(current >= policy.base_delay);
        }
    }
}
