//! Configuration defaults and environment overrides.
//!
//! Every tunable the VM exposes lives here so the individual crates never
//! redefine the same constants or re-read the same environment variables.

/// Scheduler queue configuration.
pub mod queue {
    /// Capacity of the ready queue and the future queue. Producers block
    /// when the queue is full; this bound is the engine's only
    /// backpressure mechanism.
    pub const DEFAULT_CAPACITY: usize = 10;
}

/// Snapshot (deferred-queue persistence) configuration.
pub mod snapshot {
    /// Default path of the rewritten-in-place snapshot file.
    pub const DEFAULT_PATH: &str = "future_task_list.bin";
    /// Seconds between snapshot ticks.
    pub const INTERVAL_SECS: u64 = 5;
}

/// Observability loop configuration.
pub mod status {
    /// Seconds between counter publications.
    pub const INTERVAL_SECS: u64 = 1;
}

/// Per-device-family heartbeat intervals, in seconds. A heartbeat is the
/// expected maximum gap between successive generated-data records.
pub mod heartbeat {
    /// Occupancy sensors report every minute while powered.
    pub const OCCUPANCY_SECS: i64 = 60;
    /// Sustained-occupancy checks tolerate one missed report.
    pub const OCCUPANCY_FOR_SECS: i64 = 120;
    /// Switch devices report relay state every five minutes.
    pub const SWITCH_STATE_SECS: i64 = 300;
}

/// Timer slack added to every future-queue delay before the deferred rule
/// re-enters the ready queue.
pub mod timer {
    pub const FIRE_SLACK_SECS: u64 = 2;
}

/// Environment variable names.
pub mod env_vars {
    pub const SNAPSHOT_PATH: &str = "RULEVM_SNAPSHOT_PATH";
    pub const QUEUE_CAPACITY: &str = "RULEVM_QUEUE_CAPACITY";
    pub const SMTP_SERVER: &str = "RULEVM_SMTP_SERVER";
    pub const SMTP_PORT: &str = "RULEVM_SMTP_PORT";
    pub const SMTP_USERNAME: &str = "RULEVM_SMTP_USERNAME";
    pub const SMTP_PASSWORD: &str = "RULEVM_SMTP_PASSWORD";
    pub const SMTP_FROM: &str = "RULEVM_SMTP_FROM";

    use super::{queue, snapshot};

    /// Snapshot path from the environment, or the default.
    pub fn snapshot_path() -> String {
        std::env::var(SNAPSHOT_PATH).unwrap_or_else(|_| snapshot::DEFAULT_PATH.to_string())
    }

    /// Queue capacity from the environment, or the default.
    pub fn queue_capacity() -> usize {
        std::env::var(QUEUE_CAPACITY)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(queue::DEFAULT_CAPACITY)
    }
}

/// SMTP configuration for the email action, sourced from the environment.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl SmtpConfig {
    /// Load from the `RULEVM_SMTP_*` environment variables. Returns `None`
    /// when the server is not configured; the email action then logs and
    /// skips the send.
    pub fn from_env() -> Option<Self> {
        let server = std::env::var(env_vars::SMTP_SERVER).ok()?;
        Some(Self {
            server,
            port: std::env::var(env_vars::SMTP_PORT)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(587),
            username: std::env::var(env_vars::SMTP_USERNAME).unwrap_or_default(),
            password: std::env::var(env_vars::SMTP_PASSWORD).unwrap_or_default(),
            from_address: std::env::var(env_vars::SMTP_FROM)
                .unwrap_or_else(|_| "automated@rulevm.local".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_capacity_default() {
        assert_eq!(env_vars::queue_capacity(), queue::DEFAULT_CAPACITY);
    }

    #[test]
    fn test_snapshot_path_default() {
        assert_eq!(env_vars::snapshot_path(), snapshot::DEFAULT_PATH);
    }
}
