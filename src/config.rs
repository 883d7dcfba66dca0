//! Configuration types.

use std::time::Duration;

use crate::fetch::FetchOptions;

/// Engine configuration. All knobs are read once at cycle start.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Max messages ingested per cycle per mailbox.
    pub batch_size: usize,
    /// IMAP SINCE window in days.
    pub since_days: u32,
    /// Max concurrently syncing mailboxes.
    pub worker_pool_size: usize,
    /// Time between cycle triggers.
    pub cycle_interval: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Timeout waiting for the server greeting.
    pub greeting_timeout: Duration,
    /// Read timeout for all subsequent IMAP round-trips.
    pub socket_timeout: Duration,
    /// If true, log the first 500 chars of bounce bodies that yield no
    /// recipient or diagnostic.
    pub debug_bounces: bool,
    /// Whether the bounce parser also scans the subject line for a failed
    /// recipient when the body yields none.
    pub bounce_subject_fallback: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            since_days: 30,
            worker_pool_size: 1,
            cycle_interval: Duration::from_secs(300), // 5 minutes
            connect_timeout: Duration::from_secs(20),
            greeting_timeout: Duration::from_secs(15),
            socket_timeout: Duration::from_secs(30),
            debug_bounces: false,
            bounce_subject_fallback: true,
        }
    }
}

impl SyncConfig {
    /// Build SyncConfig from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("MAILSIFT_BATCH_SIZE", defaults.batch_size),
            since_days: env_parse("MAILSIFT_SINCE_DAYS", defaults.since_days),
            worker_pool_size: env_parse("MAILSIFT_WORKER_POOL_SIZE", defaults.worker_pool_size),
            cycle_interval: Duration::from_secs(env_parse("MAILSIFT_CYCLE_INTERVAL_SECS", 300)),
            connect_timeout: Duration::from_secs(env_parse("MAILSIFT_CONNECT_TIMEOUT_SECS", 20)),
            greeting_timeout: Duration::from_secs(env_parse("MAILSIFT_GREETING_TIMEOUT_SECS", 15)),
            socket_timeout: Duration::from_secs(env_parse("MAILSIFT_SOCKET_TIMEOUT_SECS", 30)),
            debug_bounces: env_flag("MAILSIFT_DEBUG_BOUNCES", false),
            bounce_subject_fallback: env_flag("MAILSIFT_BOUNCE_SUBJECT_FALLBACK", true),
        }
    }

    /// The subset of configuration the IMAP fetcher needs.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            batch_size: self.batch_size,
            since_days: self.since_days,
            connect_timeout: self.connect_timeout,
            greeting_timeout: self.greeting_timeout,
            socket_timeout: self.socket_timeout,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v != "false" && v != "0",
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.since_days, 30);
        assert_eq!(config.worker_pool_size, 1);
        assert_eq!(config.cycle_interval, Duration::from_secs(300));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.greeting_timeout, Duration::from_secs(15));
        assert_eq!(config.socket_timeout, Duration::from_secs(30));
        assert!(!config.debug_bounces);
    }

    #[test]
    fn fetch_options_mirror_config() {
        let config = SyncConfig {
            batch_size: 7,
            since_days: 3,
            ..SyncConfig::default()
        };
        let opts = config.fetch_options();
        assert_eq!(opts.batch_size, 7);
        assert_eq!(opts.since_days, 3);
        assert_eq!(opts.socket_timeout, config.socket_timeout);
    }
}
