//! Fixed operational tunables for the remote-host operations core.
//!
//! The constants here are the contract values baked into the pool, the
//! health monitor and the transport dial path. [`CoreSettings`] carries the
//! subset that deployments (and tests) are allowed to override.

use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of dial attempts per transport before surfacing the error.
pub const DIAL_ATTEMPTS: u32 = 3;

/// Base unit of the linear back-off between dial attempts (2s, then 4s).
pub const DIAL_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Soft wall-clock bound applied to a single remote command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Timeout for TCP connect plus SSH handshake of one dial attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout applied to a single health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between health monitor sweeps.
pub const MONITOR_TICK: Duration = Duration::from_secs(30);

/// Interval between pool stale-cleanup sweeps.
pub const CLEANUP_TICK: Duration = Duration::from_secs(5 * 60);

/// Idle age after which a pooled transport is evicted.
pub const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Pause between a service start/restart and its `is-active` verification.
pub const SERVICE_VERIFY_DELAY: Duration = Duration::from_secs(2);

/// Keep-alive interval advertised to the SSH peer.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive probe failures at which an entry is considered unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Consecutive probe failures at which an entry is marked failed and
/// scheduled for eviction.
pub const FAILED_AFTER_FAILURES: u32 = 5;

/// Marker echoed by health probes. The round-trip must reproduce it.
pub const PROBE_MARKER: &str = "pbfleet-probe-ok";

/// Default private key file names tried under `~/.ssh`, in priority order.
pub const DEFAULT_KEY_NAMES: &[&str] = &["id_rsa", "id_ed25519", "id_ecdsa"];

/// Overridable runtime settings for a [`crate::core::Core`].
///
/// The defaults mirror the constants above; tests shrink the timers and
/// point the host-key store at a scratch file.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Location of the known-hosts file. `None` means `~/.ssh/known_hosts`.
    pub known_hosts_path: Option<PathBuf>,
    /// Health monitor sweep interval.
    pub monitor_tick: Duration,
    /// Stale-cleanup sweep interval.
    pub cleanup_tick: Duration,
    /// Idle age after which pooled transports are evicted.
    pub stale_after: Duration,
    /// Per-probe timeout used by the health monitor.
    pub probe_timeout: Duration,
    /// Pause before verifying a started/restarted service.
    pub service_verify_delay: Duration,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            known_hosts_path: None,
            monitor_tick: MONITOR_TICK,
            cleanup_tick: CLEANUP_TICK,
            stale_after: STALE_AFTER,
            probe_timeout: PROBE_TIMEOUT,
            service_verify_delay: SERVICE_VERIFY_DELAY,
        }
    }
}

/// Linear back-off before dial attempt `next_attempt` (1-based).
///
/// Attempt 2 waits 2s, attempt 3 waits 4s. The first attempt never waits.
pub fn dial_backoff(next_attempt: u32) -> Duration {
    if next_attempt <= 1 {
        Duration::ZERO
    } else {
        DIAL_BACKOFF_STEP * (next_attempt - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear() {
        assert_eq!(dial_backoff(1), Duration::ZERO);
        assert_eq!(dial_backoff(2), Duration::from_secs(2));
        assert_eq!(dial_backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn default_settings_match_contract_values() {
        let settings = CoreSettings::default();
        assert_eq!(settings.monitor_tick, Duration::from_secs(30));
        assert_eq!(settings.stale_after, Duration::from_secs(900));
        assert_eq!(settings.cleanup_tick, Duration::from_secs(300));
        assert!(settings.known_hosts_path.is_none());
    }
}
