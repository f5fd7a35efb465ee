//! Configuration management
//!
//! All tunables live here, loaded once from environment variables.
//! No hardcoded thresholds or timings elsewhere in the codebase.

use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path
    pub db_path: PathBuf,

    /// Owner chat/user id the companion talks to
    pub owner_id: i64,

    /// Heartbeat tick cadence
    pub heartbeat_interval: Duration,

    /// Awake window: proactive contact allowed in [start, end) local hours
    pub awake_hour_start: u32,
    pub awake_hour_end: u32,

    /// Maximum proactive notifications per day-window
    pub max_daily_notifications: u32,

    /// Minimum spacing between consecutive notifications
    pub notify_cooldown: Duration,

    /// Think at least this often even without a delta
    pub think_fallback: Duration,

    /// Local hour at which nightly consolidation runs
    pub consolidation_hour: u32,

    /// UTC offset (hours) used for local hours and day boundaries
    pub utc_offset_hours: i32,

    /// Per-sensor invocation timeout
    pub sensor_timeout: Duration,

    /// Overall sensor collection deadline per tick
    pub collection_deadline: Duration,

    /// Reasoning call timeout
    pub reasoning_timeout: Duration,

    /// Core summary length bound (chars)
    pub core_summary_max_chars: usize,

    /// Raw turns older than this are compressed once processed
    pub turn_retention_days: i64,

    /// Dedup merge threshold (word-set overlap coefficient, 0.0-1.0)
    pub dedup_similarity: f64,

    /// Reasoning service endpoint (OpenAI-compatible chat completions)
    pub reasoning_url: Option<String>,
    pub reasoning_api_key: Option<String>,
    pub reasoning_model: String,

    /// Telegram bot token (transport)
    pub telegram_token: Option<String>,

    /// Config keys that were present at startup. Sensors declaring a
    /// `requires_config` key not in this set are force-disabled.
    pub present_keys: HashSet<String>,
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("COMPANION_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/companion.db"));

        // Remember which keys exist so sensor manifests can be checked
        // without re-reading the environment later.
        let present_keys: HashSet<String> = std::env::vars()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k)
            .collect();

        let config = Self {
            db_path,
            owner_id: env_i64("OWNER_USER_ID", 0),
            heartbeat_interval: Duration::from_secs(
                60 * env_u32("HEARTBEAT_INTERVAL_MINUTES", 20) as u64,
            ),
            awake_hour_start: env_u32("AWAKE_HOUR_START", 7),
            awake_hour_end: env_u32("AWAKE_HOUR_END", 23),
            max_daily_notifications: env_u32("MAX_DAILY_NOTIFICATIONS", 10),
            notify_cooldown: env_secs("NOTIFY_COOLDOWN_SECONDS", 1800),
            think_fallback: Duration::from_secs(
                60 * env_u32("THINK_FALLBACK_MINUTES", 60) as u64,
            ),
            consolidation_hour: env_u32("CONSOLIDATION_HOUR", 3),
            utc_offset_hours: env_i64("TIMEZONE_OFFSET_HOURS", 0) as i32,
            sensor_timeout: env_secs("SENSOR_TIMEOUT_SECONDS", 5),
            collection_deadline: env_secs("COLLECTION_DEADLINE_SECONDS", 10),
            reasoning_timeout: env_secs("REASONING_TIMEOUT_SECONDS", 60),
            core_summary_max_chars: env_u32("CORE_SUMMARY_MAX_CHARS", 4000) as usize,
            turn_retention_days: env_i64("TURN_RETENTION_DAYS", 30),
            dedup_similarity: std::env::var("DEDUP_SIMILARITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.6),
            reasoning_url: std::env::var("REASONING_BASE_URL").ok(),
            reasoning_api_key: std::env::var("REASONING_API_KEY").ok(),
            reasoning_model: std::env::var("REASONING_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            telegram_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            present_keys,
        };
        Ok(config.normalized())
    }

    /// Enforce cross-field constraints. A per-sensor timeout beyond the
    /// collection deadline would be cut short by the deadline abort
    /// without ever counting as a sensor failure, so the deadline caps
    /// it.
    pub fn normalized(mut self) -> Self {
        if self.sensor_timeout > self.collection_deadline {
            self.sensor_timeout = self.collection_deadline;
        }
        self
    }

    /// Whether `hour` (local) falls inside the awake window
    pub fn in_awake_window(&self, hour: u32) -> bool {
        self.awake_hour_start <= hour && hour < self.awake_hour_end
    }

    /// Local timezone derived from the configured UTC offset
    pub fn tz(&self) -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap())
    }

    /// Compact config for tests and dry runs: permissive windows,
    /// short timeouts, no external services.
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            db_path,
            owner_id: 1,
            heartbeat_interval: Duration::from_secs(1),
            awake_hour_start: 0,
            awake_hour_end: 24,
            max_daily_notifications: 10,
            notify_cooldown: Duration::from_secs(0),
            think_fallback: Duration::from_secs(3600),
            consolidation_hour: 3,
            utc_offset_hours: 0,
            sensor_timeout: Duration::from_millis(200),
            collection_deadline: Duration::from_millis(500),
            reasoning_timeout: Duration::from_secs(2),
            core_summary_max_chars: 4000,
            turn_retention_days: 30,
            dedup_similarity: 0.6,
            reasoning_url: None,
            reasoning_api_key: None,
            reasoning_model: "test".to_string(),
            telegram_token: None,
            present_keys: HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_awake_window() {
        let mut cfg = Config::for_tests(PathBuf::from(":memory:"));
        cfg.awake_hour_start = 7;
        cfg.awake_hour_end = 23;

        assert!(cfg.in_awake_window(7));
        assert!(cfg.in_awake_window(14));
        assert!(cfg.in_awake_window(22));
        assert!(!cfg.in_awake_window(23));
        assert!(!cfg.in_awake_window(3));
    }

    #[test]
    fn test_sensor_timeout_capped_by_collection_deadline() {
        let mut cfg = Config::for_tests(PathBuf::from(":memory:"));
        cfg.sensor_timeout = Duration::from_secs(30);
        cfg.collection_deadline = Duration::from_secs(10);

        let cfg = cfg.normalized();
        assert_eq!(cfg.sensor_timeout, Duration::from_secs(10));

        // Already-sane values pass through untouched
        let cfg = Config::for_tests(PathBuf::from(":memory:")).normalized();
        assert_eq!(cfg.sensor_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_tz_offset() {
        let mut cfg = Config::for_tests(PathBuf::from(":memory:"));
        cfg.utc_offset_hours = 9;
        assert_eq!(cfg.tz().local_minus_utc(), 9 * 3600);
    }
}
