//! Sensor subsystem
//!
//! Sensors are passive, read-only, interval-throttled data sources
//! feeding context into the heartbeat. Each one ships a declarative
//! TOML manifest (name, interval, enabled, requires_config) validated
//! at startup; the registry is populated from an explicit list of
//! constructors rather than directory scanning.
//!
//! The runtime enforces throttling and failure isolation centrally, so
//! individual sensors carry no defensive boilerplate: a sensor that
//! stalls or errors can never take the heartbeat down with it.

pub mod builtin;
pub mod manifest;
pub mod registry;
pub mod runtime;

pub use manifest::{ManifestError, SensorManifest};
pub use registry::{DiscoveryReport, SensorRegistry};
pub use runtime::{Sensor, SensorReading, SensorState, MAX_CONSECUTIVE_FAILURES};
