//! BLE communication module.
//!
//! The link state machine ([`connection`]) talks to the radio only through
//! the [`RadioLink`] seam; [`platform`] provides the btleplug implementation.

pub mod backoff;
pub mod connection;
pub mod platform;
pub mod radio;
pub mod timer;
pub mod uuids;
pub mod wake_scan;

#[cfg(test)]
pub(crate) mod fake;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionManager, LinkState, ManagerInput, RetryCounters};
pub use platform::{default_adapter, BtleplugRadio};
pub use radio::{
    CharacteristicHandle, DeviceId, DiscoveryOutcome, GattTable, RadioEvent, RadioLink, SessionId,
};
pub use timer::{Scheduler, Timer, TimerKind};
pub use uuids::*;
pub use wake_scan::WakeScanCycle;
