//! Sensor runtime
//!
//! `SensorState` wraps one sensor with its mutable runtime state and
//! enforces the invocation contract in `safe_observe`:
//!
//! 1. Disabled sensors return empty without counting as an attempt.
//! 2. Inside the interval window, the cached last-successful result is
//!    returned without invoking the sensor body.
//! 3. Otherwise the body runs under a bounded timeout. Success resets
//!    the failure counter and refreshes the cache; timeout or fault
//!    increments it and yields empty for this tick.
//! 4. At 5 consecutive failures the sensor is disabled for the rest of
//!    the session.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::manifest::SensorManifest;
use crate::error::CompanionError;

/// Flat result mapping produced by one sensor. Empty means "nothing to
/// report" and is omitted from snapshots.
pub type SensorReading = serde_json::Map<String, serde_json::Value>;

/// Consecutive failures before a sensor is disabled for the session
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Sensor capability interface. Implementations are plain data
/// collectors; throttling, timeouts and failure isolation live here in
/// the runtime, not in the sensor.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Collect data. Return an empty mapping if there is nothing to
    /// report; return an error on failure, the runtime counts it.
    async fn observe(&self) -> anyhow::Result<SensorReading>;
}

/// One sensor plus its mutable runtime state
pub struct SensorState {
    pub manifest: SensorManifest,
    sensor: Arc<dyn Sensor>,
    enabled: bool,
    /// Set when the sensor was disabled (config missing, failure cap)
    disabled_reason: Option<String>,
    consecutive_failures: u32,
    last_run: Option<DateTime<FixedOffset>>,
    last_result: SensorReading,
}

impl SensorState {
    pub fn new(manifest: SensorManifest, sensor: Arc<dyn Sensor>) -> Self {
        let enabled = manifest.enabled;
        Self {
            manifest,
            sensor,
            enabled,
            disabled_reason: None,
            consecutive_failures: 0,
            last_run: None,
            last_result: SensorReading::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_run(&self) -> Option<DateTime<FixedOffset>> {
        self.last_run
    }

    /// Disable for the remainder of the session
    pub fn disable(&mut self, reason: &str) {
        self.enabled = false;
        self.disabled_reason = Some(reason.to_string());
    }

    fn within_interval(&self, now: DateTime<FixedOffset>) -> bool {
        match self.last_run {
            Some(last) => {
                let elapsed = (now - last).num_seconds().max(0) as u64;
                elapsed < self.manifest.interval_duration().as_secs()
            }
            None => false,
        }
    }

    /// Invoke the sensor under the runtime contract and update state as
    /// one logical step.
    pub async fn safe_observe(
        &mut self,
        now: DateTime<FixedOffset>,
        timeout: Duration,
    ) -> SensorReading {
        if !self.enabled {
            return SensorReading::new();
        }

        if self.within_interval(now) {
            debug!("Sensor {} throttled, serving cached result", self.name());
            return self.last_result.clone();
        }

        let outcome = tokio::time::timeout(timeout, self.sensor.observe()).await;
        match outcome {
            Ok(Ok(data)) => {
                self.consecutive_failures = 0;
                self.last_run = Some(now);
                self.last_result = data.clone();
                data
            }
            Ok(Err(e)) => {
                self.record_failure(CompanionError::SensorFault {
                    name: self.name().to_string(),
                    reason: e.to_string(),
                });
                SensorReading::new()
            }
            Err(_) => {
                self.record_failure(CompanionError::SensorTimeout {
                    name: self.name().to_string(),
                    timeout,
                });
                SensorReading::new()
            }
        }
    }

    fn record_failure(&mut self, err: CompanionError) {
        self.consecutive_failures += 1;
        warn!(
            "Sensor {} failed ({} consecutive): {}",
            self.name(),
            self.consecutive_failures,
            err
        );
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            warn!(
                "Sensor {} hit {} consecutive failures, disabled until restart",
                self.name(),
                MAX_CONSECUTIVE_FAILURES
            );
            self.disable("consecutive failure cap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 8, 30, h, m, 0)
            .unwrap()
    }

    fn manifest(name: &str, interval: u32) -> SensorManifest {
        SensorManifest::parse(&format!("name = \"{name}\"\ninterval = {interval}\n")).unwrap()
    }

    struct CountingSensor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Sensor for CountingSensor {
        async fn observe(&self) -> anyhow::Result<SensorReading> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut out = SensorReading::new();
            out.insert("calls".into(), serde_json::json!(n));
            Ok(out)
        }
    }

    struct FailingSensor;

    #[async_trait]
    impl Sensor for FailingSensor {
        async fn observe(&self) -> anyhow::Result<SensorReading> {
            anyhow::bail!("upstream unreachable")
        }
    }

    struct HangingSensor;

    #[async_trait]
    impl Sensor for HangingSensor {
        async fn observe(&self) -> anyhow::Result<SensorReading> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SensorReading::new())
        }
    }

    #[tokio::test]
    async fn test_interval_throttle_serves_cache() {
        let sensor = Arc::new(CountingSensor {
            calls: AtomicU32::new(0),
        });
        let mut state = SensorState::new(manifest("counter", 60), sensor);
        let timeout = Duration::from_secs(1);

        // First run at T invokes the body
        let r = state.safe_observe(at(10, 0), timeout).await;
        assert_eq!(r["calls"], 1);

        // T+30min: inside the interval, cached result, no re-invocation
        let r = state.safe_observe(at(10, 30), timeout).await;
        assert_eq!(r["calls"], 1);

        // T+61min: fresh invocation
        let r = state.safe_observe(at(11, 1), timeout).await;
        assert_eq!(r["calls"], 2);
    }

    #[tokio::test]
    async fn test_disabled_sensor_returns_empty() {
        let sensor = Arc::new(CountingSensor {
            calls: AtomicU32::new(0),
        });
        let mut state = SensorState::new(manifest("counter", 1), sensor.clone());
        state.disable("missing config");

        let r = state.safe_observe(at(10, 0), Duration::from_secs(1)).await;
        assert!(r.is_empty());
        assert_eq!(sensor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auto_disable_after_five_failures() {
        let mut state = SensorState::new(manifest("flaky", 1), Arc::new(FailingSensor));
        let timeout = Duration::from_secs(1);

        for i in 0..5u32 {
            // Step a minute forward each time so the interval gate never
            // masks the failure path
            let r = state.safe_observe(at(10, i), timeout).await;
            assert!(r.is_empty());
        }

        assert!(!state.is_enabled());
        assert_eq!(state.consecutive_failures(), 5);

        // Subsequent calls return empty without attempting invocation
        let r = state.safe_observe(at(11, 0), timeout).await;
        assert!(r.is_empty());
        assert_eq!(state.consecutive_failures(), 5);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut state = SensorState::new(manifest("slow", 1), Arc::new(HangingSensor));
        let r = state
            .safe_observe(at(10, 0), Duration::from_millis(10))
            .await;
        assert!(r.is_empty());
        assert_eq!(state.consecutive_failures(), 1);
        assert!(state.is_enabled());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        struct FlakySensor {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Sensor for FlakySensor {
            async fn observe(&self) -> anyhow::Result<SensorReading> {
                if self.calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    anyhow::bail!("transient")
                }
                Ok(SensorReading::new())
            }
        }

        let mut state = SensorState::new(
            manifest("flaky", 1),
            Arc::new(FlakySensor {
                calls: AtomicU32::new(0),
            }),
        );
        let timeout = Duration::from_secs(1);

        for i in 0..3u32 {
            state.safe_observe(at(10, i), timeout).await;
        }
        assert_eq!(state.consecutive_failures(), 3);

        state.safe_observe(at(10, 3), timeout).await;
        assert_eq!(state.consecutive_failures(), 0);
        assert!(state.is_enabled());
    }
}
