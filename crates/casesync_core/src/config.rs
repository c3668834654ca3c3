//! Engine tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a write does while the session shows cached data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedWritePolicy {
    /// Apply locally and queue for replay on reconnect.
    #[default]
    Queue,
    /// Refuse the write with [`WriteError::Degraded`](crate::error::WriteError::Degraded).
    Reject,
}

/// Timing and retry settings for a [`CaseSession`](crate::session::CaseSession).
///
/// Deserializes from a partial table; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval of the form-state and participant polls.
    pub poll_interval_secs: u64,
    /// Interval of the presence heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Total join attempts before giving up.
    pub join_max_attempts: u32,
    /// Delay between join attempts.
    pub join_retry_delay_secs: u64,
    /// Failed replays after which a pending write is abandoned.
    pub replay_max_attempts: u32,
    /// Write behaviour in degraded mode.
    pub degraded_writes: DegradedWritePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            heartbeat_interval_secs: 30,
            join_max_attempts: 3,
            join_retry_delay_secs: 2,
            replay_max_attempts: 3,
            degraded_writes: DegradedWritePolicy::Queue,
        }
    }
}

impl SyncConfig {
    /// Poll interval as a duration (never zero).
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Heartbeat interval as a duration (never zero).
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Delay between join attempts.
    pub fn join_retry_delay(&self) -> Duration {
        Duration::from_secs(self.join_retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.join_max_attempts, 3);
        assert_eq!(config.join_retry_delay(), Duration::from_secs(2));
        assert_eq!(config.degraded_writes, DegradedWritePolicy::Queue);
    }

    #[test]
    fn test_partial_table_keeps_defaults() {
        let config: SyncConfig = serde_json::from_value(json!({
            "poll_interval_secs": 10,
            "degraded_writes": "reject"
        }))
        .unwrap();
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.degraded_writes, DegradedWritePolicy::Reject);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = SyncConfig {
            poll_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
