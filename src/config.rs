//! Runtime configuration.
//!
//! ## Environment Variables
//!
//! - `THREADCTL_POLL_INTERVAL`: plain executor steps between periodic polls (default: 1024)
//! - `THREADCTL_WAKE_SLICE_MS`: longest uninterrupted wait inside blocking helpers (default: 10)
//! - `THREADCTL_SUSPEND_WARN_MS`: warn when a suspend is not acknowledged within this time (default: 1000)
//! - `THREADCTL_SHUTDOWN_GRACE_MS`: how long `shutdown` waits for killed threads (default: 5000)
//! - `THREADCTL_EXIT_STATUS`: exit status carried by kill signals (default: 0)
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};

const DEFAULT_POLL_INTERVAL: u32 = 1024;
const DEFAULT_WAKE_SLICE: Duration = Duration::from_millis(10);
const DEFAULT_SUSPEND_ACK_WARN: Duration = Duration::from_secs(1);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Number of plain steps an executor runs between periodic safepoint polls.
    pub poll_interval: u32,
    /// Blocking helpers wait at most this long before re-checking wake flags.
    pub wake_slice: Duration,
    /// A suspend that is not acknowledged within this time logs a warning.
    pub suspend_ack_warn: Duration,
    /// How long `Runtime::shutdown` waits for killed threads to terminate.
    pub shutdown_grace: Duration,
    /// Exit status reported by kill signals until `request_exit` overrides it.
    pub exit_status: i32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            wake_slice: DEFAULT_WAKE_SLICE,
            suspend_ack_warn: DEFAULT_SUSPEND_ACK_WARN,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            exit_status: 0,
        }
    }
}

impl ControlConfig {
    /// Defaults overridden by any `THREADCTL_*` variables that parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_var::<u32>("THREADCTL_POLL_INTERVAL") {
            config.poll_interval = v.max(1);
        }
        if let Some(ms) = parse_var::<u64>("THREADCTL_WAKE_SLICE_MS") {
            config.wake_slice = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_var::<u64>("THREADCTL_SUSPEND_WARN_MS") {
            config.suspend_ack_warn = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("THREADCTL_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(status) = parse_var::<i32>("THREADCTL_EXIT_STATUS") {
            config.exit_status = status;
        }
        config
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ControlConfig = serde_json::from_str(r#"{"exit_status": 7}"#).unwrap();
        assert_eq!(config.exit_status, 7);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.wake_slice, DEFAULT_WAKE_SLICE);
    }
}
