//! Shared daemon context
//!
//! One explicit object threaded through the scheduler, sensor runtime
//! and action executor instead of global mutable state. The cycle lock
//! is the single mutual-exclusion point over the core summary and
//! rate-limit state: a Think cycle never observes a half-rebuilt
//! summary, and consolidation never races a rate-limit update.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::rate_limit::RateLimitState;
use crate::sensors::SensorRegistry;
use crate::store::Store;

pub struct Context {
    pub config: Config,
    pub store: Arc<Mutex<Store>>,
    pub registry: SensorRegistry,
    pub rate_limit: Arc<Mutex<RateLimitState>>,
    /// Held for the duration of a decision cycle or a consolidation run
    pub cycle_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Context {
    /// Build the context, restoring persisted rate-limit state
    pub fn new(config: Config, store: Store, registry: SensorRegistry) -> Result<Arc<Self>> {
        let rate_limit = store.load_rate_limit()?;
        Ok(Arc::new(Self {
            config,
            store: Arc::new(Mutex::new(store)),
            registry,
            rate_limit: Arc::new(Mutex::new(rate_limit)),
            cycle_lock: Arc::new(tokio::sync::Mutex::new(())),
        }))
    }

    /// Current time in the configured offset
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.config.tz())
    }

    /// Snapshot of the current rate-limit state
    pub fn rate_limit_snapshot(&self) -> RateLimitState {
        self.rate_limit
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    #[test]
    fn test_context_restores_rate_limit() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_rate_limit(&RateLimitState {
                count_today: 7,
                day_key: "2026-08-30".into(),
                last_notify_at: None,
            })
            .unwrap();

        let ctx = Context::new(
            Config::for_tests(PathBuf::from(":memory:")),
            store,
            SensorRegistry::discover(vec![], &HashSet::new()),
        )
        .unwrap();

        assert_eq!(ctx.rate_limit_snapshot().count_today, 7);
    }
}
