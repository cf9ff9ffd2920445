//! Run configuration shared by the supervisor, workers, and exporter.

use chrono::NaiveDate;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of worker processes.
const DEFAULT_POOL_SIZE: usize = 2;

/// Total attempts for one sub-range before the folder export fails.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Fixed sleep between sub-range retry attempts.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Width of the fine-grained export windows.
pub const WINDOW_DAYS: i64 = 10;

/// A queue item PROCESSING longer than this is presumed stuck.
const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// How often the supervisor polls slots and queue items.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for one export run.
///
/// Carries the pool sizing, filesystem layout, and the retry/staleness
/// constants. All durations are injectable so tests never sleep.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of worker slots in the pool.
    pub pool_size: usize,
    /// Global resume point: fine-grained windows start here. `None` means
    /// the fixed lower bound of the partition.
    pub start_date: Option<NaiveDate>,
    /// Suffix appended to each user identifier to form the mail address
    /// (e.g. "@example.org"). Empty by default.
    pub mail_suffix: String,
    /// Root of the mailbox source tree (JSON provider).
    pub mail_root: PathBuf,
    /// Root of the destination export tree.
    pub export_root: PathBuf,
    /// Shared state database path.
    pub db_path: PathBuf,
    /// Directory for per-slot worker logs.
    pub log_dir: PathBuf,
    /// Total attempts per sub-range.
    pub max_attempts: u32,
    /// Sleep between sub-range attempts.
    pub retry_backoff: Duration,
    /// PROCESSING-older-than-this is stuck.
    pub processing_timeout: Duration,
    /// Supervisor polling interval.
    pub poll_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            start_date: None,
            mail_suffix: String::new(),
            mail_root: PathBuf::from("."),
            export_root: crate::paths::get_export_root(),
            db_path: crate::paths::get_state_db_path(),
            log_dir: crate::paths::get_log_dir(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RunConfig {
    /// Full mail address for a user identifier.
    pub fn address(&self, user: &str) -> String {
        format!("{}{}", user, self.mail_suffix)
    }

    /// Export path for one user. A resumed run gets a distinct tree
    /// carrying the start date in its name.
    pub fn user_export_path(&self, user: &str) -> PathBuf {
        let address = self.address(user);
        match self.start_date {
            Some(date) => self.export_root.join(format!("{}_{}", address, date)),
            None => self.export_root.join(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_source_constants() {
        let config = RunConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff, Duration::from_secs(30));
        assert_eq!(config.processing_timeout, Duration::from_secs(180));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_user_export_path_plain() {
        let config = RunConfig {
            export_root: PathBuf::from("/tmp/export"),
            mail_suffix: "@example.org".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.user_export_path("alice"),
            PathBuf::from("/tmp/export/alice@example.org")
        );
    }

    #[test]
    fn test_user_export_path_with_resume_date() {
        let config = RunConfig {
            export_root: PathBuf::from("/tmp/export"),
            start_date: Some(NaiveDate::from_ymd_opt(2015, 6, 1).unwrap()),
            ..Default::default()
        };
        assert_eq!(
            config.user_export_path("bob"),
            PathBuf::from("/tmp/export/bob_2015-06-01")
        );
    }
}
