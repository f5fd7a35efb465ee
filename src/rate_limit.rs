//! Proactive notification rate limiting
//!
//! Tracks how many proactive messages went out in the current
//! day-window (day boundary computed in the configured UTC offset) and
//! when the last one was sent. Mutated only by the action executor
//! after a successful delivery; persisted through the store so the
//! counter survives restarts.

use chrono::{DateTime, FixedOffset};
use std::time::Duration;

/// Why a notify was suppressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyDenied {
    /// Daily cap reached for the current day-window
    DailyCapReached { cap: u32 },
    /// Last notification was too recent
    CooldownActive { remaining_secs: i64 },
}

/// Persistent rate-limit state for proactive notifications
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    /// Notifications sent in the current day-window
    pub count_today: u32,
    /// Day key (`YYYY-MM-DD` in the configured offset) the count belongs to
    pub day_key: String,
    /// Unix timestamp of the last delivered notification
    pub last_notify_at: Option<i64>,
}

impl RateLimitState {
    /// Day key for `now` in the local offset
    pub fn day_key_for(now: DateTime<FixedOffset>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    /// Reset the counter when the day-window has rolled over
    pub fn roll_window(&mut self, now: DateTime<FixedOffset>) {
        let key = Self::day_key_for(now);
        if self.day_key != key {
            self.day_key = key;
            self.count_today = 0;
        }
    }

    /// Check whether a notify may go out right now.
    ///
    /// Rolls the day-window first, so a stale persisted count from
    /// yesterday never blocks today's first notification.
    pub fn check(
        &mut self,
        now: DateTime<FixedOffset>,
        cap: u32,
        cooldown: Duration,
    ) -> Result<(), NotifyDenied> {
        self.roll_window(now);

        if self.count_today >= cap {
            return Err(NotifyDenied::DailyCapReached { cap });
        }

        if let Some(last) = self.last_notify_at {
            let elapsed = now.timestamp() - last;
            let cooldown = cooldown.as_secs() as i64;
            if elapsed < cooldown {
                return Err(NotifyDenied::CooldownActive {
                    remaining_secs: cooldown - elapsed,
                });
            }
        }

        Ok(())
    }

    /// Record a successful delivery. Call only after the transport
    /// accepted the message.
    pub fn record_notify(&mut self, now: DateTime<FixedOffset>) {
        self.roll_window(now);
        self.count_today += 1;
        self.last_notify_at = Some(now.timestamp());
    }
}
