//! Sensor registry
//!
//! Populated at startup from an explicit list of (manifest, constructor)
//! pairs. Discovery validates each manifest, force-disables sensors
//! whose required config keys are absent, and records every rejection
//! in a `DiscoveryReport` - discovery itself never fails.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::manifest::SensorManifest;
use super::runtime::{Sensor, SensorState};
use crate::error::CompanionError;

/// One sensor plugin offered to discovery: raw manifest TOML plus the
/// constructor's instance.
pub struct SensorPlugin {
    pub manifest_toml: String,
    pub sensor: Arc<dyn Sensor>,
}

impl SensorPlugin {
    pub fn new(manifest_toml: &str, sensor: Arc<dyn Sensor>) -> Self {
        Self {
            manifest_toml: manifest_toml.to_string(),
            sensor,
        }
    }
}

/// What discovery accepted and what it rejected
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Registered sensor names, in registration order
    pub registered: Vec<String>,
    /// Skipped plugins: (identifier, reason)
    pub skipped: Vec<(String, String)>,
    /// Names rejected because an earlier plugin already claimed them
    pub duplicate_names: Vec<String>,
    /// Registered but force-disabled: (name, missing config keys)
    pub force_disabled: Vec<(String, Vec<String>)>,
}

/// Registry of all discovered sensors and their runtime state
pub struct SensorRegistry {
    sensors: Vec<Arc<Mutex<SensorState>>>,
    report: DiscoveryReport,
}

impl SensorRegistry {
    /// Validate manifests and build one `SensorState` per accepted
    /// plugin. Malformed manifests and duplicate names are reported,
    /// never fatal.
    pub fn discover(plugins: Vec<SensorPlugin>, present_keys: &HashSet<String>) -> Self {
        let mut report = DiscoveryReport::default();
        let mut sensors = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<SensorPlugin> = plugins.into();

        while let Some(plugin) = queue.pop_front() {
            let manifest = match SensorManifest::parse(&plugin.manifest_toml) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping sensor with malformed manifest: {}", e);
                    report
                        .skipped
                        .push((first_line(&plugin.manifest_toml), e.to_string()));
                    continue;
                }
            };

            if !seen.insert(manifest.name.clone()) {
                warn!("Duplicate sensor name '{}' rejected", manifest.name);
                report.duplicate_names.push(manifest.name.clone());
                report
                    .skipped
                    .push((manifest.name.clone(), "DuplicateSensorName".to_string()));
                continue;
            }

            let mut state = SensorState::new(manifest.clone(), plugin.sensor);

            let missing: Vec<String> = manifest
                .requires_config
                .iter()
                .filter(|k| !present_keys.contains(*k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let err = CompanionError::ConfigMissing {
                    name: manifest.name.clone(),
                    missing: missing.clone(),
                };
                info!("{err}; force-disabled");
                state.disable("missing required config");
                report
                    .force_disabled
                    .push((manifest.name.clone(), missing));
            }

            info!(
                "Registered sensor {} (interval={}m, enabled={})",
                manifest.name,
                manifest.interval,
                state.is_enabled()
            );
            report.registered.push(manifest.name);
            sensors.push(Arc::new(Mutex::new(state)));
        }

        info!(
            "Sensor discovery complete: {} registered, {} skipped",
            report.registered.len(),
            report.skipped.len()
        );
        Self { sensors, report }
    }

    pub fn report(&self) -> &DiscoveryReport {
        &self.report
    }

    /// All registered sensors (enabled or not); `safe_observe` gates on
    /// the enabled flag itself.
    pub fn sensors(&self) -> &[Arc<Mutex<SensorState>>] {
        &self.sensors
    }

    /// Names of currently enabled sensors
    pub async fn list_enabled(&self) -> Vec<String> {
        let mut names = Vec::new();
        for sensor in &self.sensors {
            let state = sensor.lock().await;
            if state.is_enabled() {
                names.push(state.name().to_string());
            }
        }
        names
    }
}

fn first_line(toml: &str) -> String {
    toml.trim()
        .lines()
        .next()
        .unwrap_or("<empty manifest>")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::runtime::SensorReading;
    use async_trait::async_trait;

    struct NoopSensor;

    #[async_trait]
    impl Sensor for NoopSensor {
        async fn observe(&self) -> anyhow::Result<SensorReading> {
            Ok(SensorReading::new())
        }
    }

    fn plugin(toml: &str) -> SensorPlugin {
        SensorPlugin::new(toml, Arc::new(NoopSensor))
    }

    #[tokio::test]
    async fn test_discovery_registers_valid_plugins() {
        let registry = SensorRegistry::discover(
            vec![
                plugin("name = \"time_context\"\ninterval = 1\n"),
                plugin("name = \"habit\"\ninterval = 60\n"),
            ],
            &HashSet::new(),
        );

        assert_eq!(registry.report().registered, vec!["time_context", "habit"]);
        assert_eq!(registry.list_enabled().await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_manifest_skipped_not_fatal() {
        let registry = SensorRegistry::discover(
            vec![
                plugin("interval = 30\n"), // no name
                plugin("name = \"ok\"\ninterval = 5\n"),
            ],
            &HashSet::new(),
        );

        assert_eq!(registry.report().registered, vec!["ok"]);
        assert_eq!(registry.report().skipped.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_and_recorded() {
        let registry = SensorRegistry::discover(
            vec![
                plugin("name = \"weather\"\ninterval = 30\n"),
                plugin("name = \"weather\"\ninterval = 10\n"),
            ],
            &HashSet::new(),
        );

        assert_eq!(registry.report().registered, vec!["weather"]);
        assert_eq!(registry.report().duplicate_names, vec!["weather"]);
        let (_, reason) = &registry.report().skipped[0];
        assert_eq!(reason, "DuplicateSensorName");
    }

    #[tokio::test]
    async fn test_missing_config_force_disables() {
        let mut present = HashSet::new();
        present.insert("WEATHER_LAT".to_string());

        let registry = SensorRegistry::discover(
            vec![plugin(
                "name = \"weather\"\ninterval = 30\nrequires_config = [\"OPENWEATHER_API_KEY\", \"WEATHER_LAT\"]\n",
            )],
            &present,
        );

        // Registered, but disabled and reported with the missing keys
        assert_eq!(registry.report().registered, vec!["weather"]);
        assert!(registry.list_enabled().await.is_empty());
        assert_eq!(
            registry.report().force_disabled[0],
            ("weather".to_string(), vec!["OPENWEATHER_API_KEY".to_string()])
        );
    }

    #[tokio::test]
    async fn test_manifest_disabled_flag_respected() {
        let registry = SensorRegistry::discover(
            vec![plugin("name = \"oura\"\ninterval = 30\nenabled = false\n")],
            &HashSet::new(),
        );
        assert_eq!(registry.report().registered, vec!["oura"]);
        assert!(registry.list_enabled().await.is_empty());
    }
}
