//! Companiond
//!
//! Always-on companion daemon: observes the owner's context on a
//! heartbeat, decides whether to act, and maintains layered long-term
//! memory that consolidates nightly.
//!
//! # Features
//!
//! - **Sensor Registry**: manifest-declared sensors with config gating
//! - **Sensor Runtime**: per-sensor throttle, timeout and auto-disable
//! - **Snapshot Builder**: concurrent fan-out under a hard deadline
//! - **Heartbeat**: Observe -> Think -> Act with salient-delta gating
//! - **Decision Protocol**: strict tagged JSON (notify / save_memory / nothing)
//! - **Action Executor**: rate-limited, awake-window-bound delivery
//! - **Consolidation**: nightly extract -> dedup -> rebuild -> compress
//!
//! # Architecture
//!
//! ```text
//! Heartbeat tick ──► Snapshot Builder ──► Delta? ──► Reasoning ──► Executor
//!                      │                                             │
//!                      └── Sensors (registry + runtime)              ├── Transport (Telegram)
//!                                                                    └── Store (SQLite)
//! Nightly ──► Consolidator: extract ► dedup ► rebuild ► compress
//! ```

pub mod config;
pub mod consolidation;
pub mod context;
pub mod decision;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod reasoning;
pub mod scheduler;
pub mod sensors;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use config::Config;
pub use consolidation::Consolidator;
pub use context::Context;
pub use decision::{parse_decision, Decision};
pub use error::CompanionError;
pub use executor::{ActionExecutor, ExecutionOutcome};
pub use rate_limit::{NotifyDenied, RateLimitState};
pub use reasoning::{HttpReasoning, Reasoning, ReasoningReply, UnconfiguredReasoning};
pub use scheduler::{Heartbeat, Phase};
pub use sensors::{Sensor, SensorReading, SensorRegistry, SensorState};
pub use snapshot::{ObservationSnapshot, SnapshotBuilder};
pub use store::Store;
pub use transport::{NullTransport, TelegramTransport, Transport};
