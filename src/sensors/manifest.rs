//! Sensor manifests
//!
//! A manifest is the typed, declarative record describing one sensor:
//!
//! ```toml
//! name = "weather"
//! interval = 30
//! enabled = true
//! requires_config = ["OPENWEATHER_API_KEY"]
//! ```
//!
//! `interval` is the minimum re-run spacing in minutes. Manifests are
//! validated at startup; a malformed one skips its sensor, it never
//! aborts discovery.

use serde::{Deserialize, Serialize};

/// Declarative per-sensor metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorManifest {
    /// Unique sensor name (alphanumeric + underscore)
    pub name: String,
    /// Minimum re-run spacing in minutes
    pub interval: u32,
    /// Whether the sensor starts enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Config keys that must be present or the sensor is force-disabled
    #[serde(default)]
    pub requires_config: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// Manifest validation errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid sensor name: {0:?}")]
    InvalidName(String),

    #[error("sensor '{0}' has a zero interval")]
    ZeroInterval(String),
}

impl SensorManifest {
    /// Parse and validate a TOML manifest
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let manifest: SensorManifest = toml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ManifestError::InvalidName(self.name.clone()));
        }
        if self.interval == 0 {
            return Err(ManifestError::ZeroInterval(self.name.clone()));
        }
        Ok(())
    }

    /// Minimum re-run spacing as a duration
    pub fn interval_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval as u64 * 60)
    }
}
