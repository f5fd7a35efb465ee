//! Observation snapshots
//!
//! One snapshot per heartbeat tick: soft context (time, silence,
//! counters) merged with concurrently-collected sensor readings.
//! Sensors fan out under an overall collection deadline; any that miss
//! it contribute nothing this tick. Empty readings are omitted so the
//! payload handed to the reasoning service stays lean.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::Config;
use crate::rate_limit::RateLimitState;
use crate::sensors::{SensorReading, SensorRegistry};
use crate::store::Store;

/// Reminders within this horizon count as "upcoming"
const REMINDER_HORIZON_SECS: i64 = 2 * 3600;

/// Point-in-time world state handed to the Think step. Built fresh each
/// cycle; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationSnapshot {
    pub timestamp: DateTime<FixedOffset>,
    pub hour: u32,
    pub weekday: String,
    /// Minutes since the owner's last message, if any exists
    pub silence_minutes: Option<i64>,
    pub messages_today: i64,
    pub active_todos: i64,
    pub upcoming_reminders: i64,
    pub notifications_sent_today: u32,
    pub notification_cap: u32,
    /// Per-sensor results; disabled and empty sensors are absent
    pub sensors: BTreeMap<String, SensorReading>,
}

/// The fields delta detection compares between consecutive snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalientFields {
    pub messages_today: i64,
    pub active_todos: i64,
    pub upcoming_reminders: i64,
    /// `sensor:signal` pairs currently asserted
    pub sensor_signals: BTreeSet<String>,
}

impl ObservationSnapshot {
    pub fn salient(&self) -> SalientFields {
        let mut sensor_signals = BTreeSet::new();
        for (name, reading) in &self.sensors {
            if let Some(signals) = reading.get("signals").and_then(|v| v.as_array()) {
                for signal in signals {
                    if let Some(s) = signal.as_str() {
                        sensor_signals.insert(format!("{name}:{s}"));
                    }
                }
            }
        }
        SalientFields {
            messages_today: self.messages_today,
            active_todos: self.active_todos,
            upcoming_reminders: self.upcoming_reminders,
            sensor_signals,
        }
    }
}

/// Builds one snapshot per tick from sensors plus store lookups
pub struct SnapshotBuilder {
    config: Config,
    store: Arc<Mutex<Store>>,
}

impl SnapshotBuilder {
    pub fn new(config: Config, store: Arc<Mutex<Store>>) -> Self {
        Self { config, store }
    }

    /// Fan-out over every registered sensor, fan-in under the overall
    /// collection deadline, then merge with soft context.
    pub async fn collect_all(
        &self,
        registry: &SensorRegistry,
        rate_limit: &RateLimitState,
    ) -> Result<ObservationSnapshot> {
        let now = Utc::now().with_timezone(&self.config.tz());
        let sensors = self.collect_sensors(registry, now).await;
        self.assemble(now, sensors, rate_limit)
    }

    async fn collect_sensors(
        &self,
        registry: &SensorRegistry,
        now: DateTime<FixedOffset>,
    ) -> BTreeMap<String, SensorReading> {
        let mut tasks = JoinSet::new();
        for sensor in registry.sensors() {
            let sensor = Arc::clone(sensor);
            let timeout = self.config.sensor_timeout;
            tasks.spawn(async move {
                let mut state = sensor.lock().await;
                let name = state.name().to_string();
                let reading = state.safe_observe(now, timeout).await;
                (name, reading)
            });
        }

        let mut results = BTreeMap::new();
        let deadline = tokio::time::sleep(self.config.collection_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((name, reading))) => {
                        // Empty readings are omitted: a quiet sensor
                        // contributes nothing, not a spurious entry
                        if !reading.is_empty() {
                            results.insert(name, reading);
                        }
                    }
                    Some(Err(e)) => warn!("Sensor task panicked: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    // Stragglers contribute nothing this tick; their own
                    // failure counters were advanced by the runtime
                    warn!("Collection deadline hit with {} sensors outstanding", tasks.len());
                    tasks.abort_all();
                    break;
                }
            }
        }

        debug!("Collected {} sensor readings", results.len());
        results
    }

    fn assemble(
        &self,
        now: DateTime<FixedOffset>,
        sensors: BTreeMap<String, SensorReading>,
        rate_limit: &RateLimitState,
    ) -> Result<ObservationSnapshot> {
        let owner = self.config.owner_id;
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| naive.and_local_timezone(self.config.tz()).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(now.timestamp() - 86_400);

        let store = self
            .store
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;

        let silence_minutes = store
            .last_user_message_at(owner)?
            .map(|last| (now.timestamp() - last).max(0) / 60);

        Ok(ObservationSnapshot {
            timestamp: now,
            hour: now.hour(),
            weekday: now.format("%A").to_string(),
            silence_minutes,
            messages_today: store.message_count_since(owner, midnight)?,
            active_todos: store.active_todo_count(owner)?,
            upcoming_reminders: store.upcoming_reminder_count(
                owner,
                now.timestamp(),
                REMINDER_HORIZON_SECS,
            )?,
            notifications_sent_today: rate_limit.count_today,
            notification_cap: self.config.max_daily_notifications,
            sensors,
        })
    }
}
