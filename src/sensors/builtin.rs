//! Builtin sensors
//!
//! Pure store reads, zero reasoning calls. These are the always-on
//! baseline; external integrations (weather, wearables) register the
//! same way with their own `requires_config` keys.

use async_trait::async_trait;
use chrono::{Datelike, FixedOffset, Timelike, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};

use super::runtime::{Sensor, SensorReading};
use crate::store::Store;

pub const TIME_CONTEXT_MANIFEST: &str = r#"
name = "time_context"
interval = 1
"#;

pub const ACTIVITY_PATTERN_MANIFEST: &str = r#"
name = "activity_pattern"
interval = 20
"#;

pub const RECENT_CONVERSATION_MANIFEST: &str = r#"
name = "recent_conversation"
interval = 10
"#;

// Minimum messages on a day to consider it "active"
const ACTIVE_DAY_THRESHOLD: i64 = 3;

// Today's count below this fraction of the personal baseline flags a
// quiet signal
const QUIET_RATIO: f64 = 0.3;

fn time_of_day_label(hour: u32) -> &'static str {
    match hour {
        5..=8 => "early_morning",
        9..=11 => "morning",
        12..=13 => "lunch",
        14..=17 => "afternoon",
        18..=20 => "evening",
        21..=23 => "night",
        _ => "late_night",
    }
}

fn holiday_name(month: u32, day: u32) -> Option<&'static str> {
    match (month, day) {
        (1, 1) => Some("New Year's Day"),
        (12, 25) => Some("Christmas"),
        (12, 31) => Some("New Year's Eve"),
        _ => None,
    }
}

/// Date, weekday, time-of-day label, weekend/holiday flags. The
/// reasoning service has no notion of "now" unless told.
pub struct TimeContextSensor {
    tz: FixedOffset,
}

impl TimeContextSensor {
    pub fn new(tz: FixedOffset) -> Self {
        Self { tz }
    }
}

#[async_trait]
impl Sensor for TimeContextSensor {
    async fn observe(&self) -> anyhow::Result<SensorReading> {
        let now = Utc::now().with_timezone(&self.tz);

        let mut out = SensorReading::new();
        out.insert("date".into(), json!(now.format("%Y-%m-%d").to_string()));
        out.insert("weekday".into(), json!(now.format("%A").to_string()));
        out.insert("hour".into(), json!(now.hour()));
        out.insert(
            "time_of_day".into(),
            json!(time_of_day_label(now.hour())),
        );
        out.insert(
            "is_weekend".into(),
            json!(now.weekday().num_days_from_monday() >= 5),
        );
        if let Some(name) = holiday_name(now.month(), now.day()) {
            out.insert("is_holiday".into(), json!(true));
            out.insert("holiday_name".into(), json!(name));
        }
        Ok(out)
    }
}

/// Conversation pattern detection over the trailing week: trend,
/// personal baseline, and derived anomaly signals the delta detector
/// treats as salient.
pub struct ActivityPatternSensor {
    store: Arc<Mutex<Store>>,
    owner_id: i64,
    tz: FixedOffset,
}

impl ActivityPatternSensor {
    pub fn new(store: Arc<Mutex<Store>>, owner_id: i64, tz: FixedOffset) -> Self {
        Self {
            store,
            owner_id,
            tz,
        }
    }
}

#[async_trait]
impl Sensor for ActivityPatternSensor {
    async fn observe(&self) -> anyhow::Result<SensorReading> {
        let now_ts = Utc::now().timestamp();
        let daily = {
            let store = self
                .store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
            store.daily_message_counts(
                self.owner_id,
                7,
                self.tz.local_minus_utc() as i64,
                now_ts,
            )?
        };
        if daily.is_empty() {
            return Ok(SensorReading::new());
        }

        let today = daily.last().map(|(_, c)| *c).unwrap_or(0);
        let yesterday = daily
            .len()
            .checked_sub(2)
            .and_then(|i| daily.get(i))
            .map(|(_, c)| *c)
            .unwrap_or(0);

        // Baseline over past active days only, so long-silent stretches
        // before the companion existed do not skew it
        let past = &daily[..daily.len() - 1];
        let active: Vec<i64> = past.iter().map(|(_, c)| *c).filter(|c| *c > 0).collect();
        let baseline = if active.is_empty() {
            0.0
        } else {
            active.iter().sum::<i64>() as f64 / active.len() as f64
        };
        let active_days = past
            .iter()
            .filter(|(_, c)| *c >= ACTIVE_DAY_THRESHOLD)
            .count();

        let mut out = SensorReading::new();
        out.insert("today_messages".into(), json!(today));
        out.insert("yesterday_messages".into(), json!(yesterday));
        out.insert("active_days_7d".into(), json!(active_days));
        out.insert(
            "weekly_trend".into(),
            json!(daily
                .iter()
                .map(|(d, c)| json!({"date": d, "count": c}))
                .collect::<Vec<_>>()),
        );

        let mut signals: Vec<String> = Vec::new();
        if yesterday >= ACTIVE_DAY_THRESHOLD && today == 0 {
            signals.push("silent_after_active_day".into());
        }
        if baseline > 0.0 && (today as f64) < baseline * QUIET_RATIO {
            if today == 0 {
                signals.push("unusually_quiet".into());
            } else {
                signals.push("below_average_activity".into());
            }
        }
        let silent_days = daily.iter().rev().take_while(|(_, c)| *c == 0).count();
        if silent_days >= 2 {
            signals.push(format!("silent_{}_days", silent_days));
        }
        if baseline > 0.0 && today as f64 > baseline * 2.0 {
            signals.push("high_engagement_today".into());
        }
        if !signals.is_empty() {
            out.insert("signals".into(), json!(signals));
        }

        Ok(out)
    }
}

/// Count and recency of turns in the last few hours
pub struct RecentConversationSensor {
    store: Arc<Mutex<Store>>,
    owner_id: i64,
    window_hours: i64,
}

impl RecentConversationSensor {
    pub fn new(store: Arc<Mutex<Store>>, owner_id: i64) -> Self {
        Self {
            store,
            owner_id,
            window_hours: 3,
        }
    }
}

#[async_trait]
impl Sensor for RecentConversationSensor {
    async fn observe(&self) -> anyhow::Result<SensorReading> {
        let now_ts = Utc::now().timestamp();
        let (count, last_ts) = {
            let store = self
                .store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
            store.recent_turn_stats(self.owner_id, now_ts - self.window_hours * 3600)?
        };
        if count == 0 {
            return Ok(SensorReading::new());
        }

        let mut out = SensorReading::new();
        out.insert("recent_turns".into(), json!(count));
        out.insert("window_hours".into(), json!(self.window_hours));
        if let Some(last) = last_ts {
            out.insert(
                "minutes_since_last".into(),
                json!((now_ts - last).max(0) / 60),
            );
        }
        Ok(out)
    }
}
