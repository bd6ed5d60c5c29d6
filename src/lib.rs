// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # sense-ble
//!
//! Keeps a persistent Bluetooth Low Energy link to a single SensePi presence
//! sensor and turns its INFO telemetry into deduplicated presence and battery
//! alerts plus a small persisted snapshot for a companion UI.
//!
//! ## Features
//!
//! - **Self-healing link**: bounded exponential backoff, in-place service
//!   rediscovery with cache refresh, and a periodic wake scan that re-attaches
//!   stacks which lost track of the sensor
//! - **Fallback polling**: the INFO characteristic is read every 15 seconds
//!   in addition to notifications
//! - **Tolerant telemetry parsing**: every historical payload shape is
//!   understood; malformed payloads never fail
//! - **Deduplicated alerts**: one presence alert per arrival, battery alerts
//!   only when entering a low band
//! - **Resume after restart**: the last device is persisted and reused
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sense_ble::{JsonFileStore, LinkConfig, Result, SenseService, TracingAlertSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = Arc::new(JsonFileStore::open("sense_state.json")?);
//!     let service = SenseService::with_default_adapter(
//!         store,
//!         Arc::new(TracingAlertSink),
//!         LinkConfig::default(),
//!     )
//!     .await?;
//!
//!     // Explicit address; `None` resumes the last-known sensor.
//!     service.start(Some("AA:BB:CC:DD:EE:FF")).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     println!("present: {}", service.presence());
//!     println!("battery: {}%", service.battery_pct());
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. CoreBluetooth hides MAC addresses,
//! so matching by address only works on Linux and Windows.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod alerts;
pub mod ble;
pub mod config;
pub mod error;
pub mod service;
pub mod store;
pub mod telemetry;

// Re-exports for convenience
pub use alerts::{Alert, AlertSink, BroadcastAlertSink, TracingAlertSink};
pub use ble::{ConnectionManager, DeviceId, LinkState, RadioEvent, RadioLink};
pub use config::LinkConfig;
pub use error::{Error, Result};
pub use service::SenseService;
pub use store::{JsonFileStore, MemoryStore, PersistedSnapshot, StateStore};
pub use telemetry::{BatteryBucket, DedupNotifier, TelemetryFact, TelemetryPipeline};
