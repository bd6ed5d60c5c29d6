//! The radio seam.
//!
//! [`RadioLink`] is the boundary between the link state machine and the
//! platform BLE stack. Every request returns immediately; outcomes arrive
//! later as [`RadioEvent`]s tagged with the [`SessionId`] they belong to.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// Opaque address of the sensor (a MAC address on most platforms).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identity. Blank strings are rejected.
    pub fn new(address: impl Into<String>) -> Option<Self> {
        let address = address.into();
        let trimmed = address.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// The address as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against an address reported by the radio, ignoring case.
    pub fn matches(&self, address: &str) -> bool {
        self.0.eq_ignore_ascii_case(address.trim())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generation tag of one connect-to-disconnect lifetime of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to the INFO characteristic, valid for one session only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Session the characteristic was resolved in.
    pub session: SessionId,
    /// Owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

/// One characteristic in a discovered GATT table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Raw property flags as reported by the stack.
    pub properties: u8,
}

/// One service in a discovered GATT table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics exposed by the service.
    pub characteristics: Vec<GattCharacteristic>,
}

/// Services and characteristics reported by a discovery round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GattTable {
    /// Discovered services.
    pub services: Vec<GattService>,
}

impl GattTable {
    /// Create a table from a list of services.
    pub fn new(services: Vec<GattService>) -> Self {
        Self { services }
    }

    /// Look up a characteristic inside a specific service.
    pub fn find(&self, service: &Uuid, characteristic: &Uuid) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == *service)
            .and_then(|s| s.characteristics.iter().find(|c| c.uuid == *characteristic))
    }
}

impl fmt::Display for GattTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GATT table:")?;
        for service in &self.services {
            writeln!(f, "  SVC {}", service.uuid)?;
            for ch in &service.characteristics {
                writeln!(f, "    CH  {} props={:#04x}", ch.uuid, ch.properties)?;
            }
        }
        Ok(())
    }
}

/// Result of a service discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Discovery completed; the table may or may not hold the INFO characteristic.
    Success(GattTable),
    /// The stack reported a non-success status.
    Failed(String),
}

/// Asynchronous outcome reported by a [`RadioLink`].
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// The link for `session` is up.
    Connected {
        /// Session the connect request was tagged with.
        session: SessionId,
    },
    /// The link for `session` was lost or the connect attempt failed.
    Disconnected {
        /// Session the link belonged to.
        session: SessionId,
        /// Stack-provided reason, if any.
        reason: Option<String>,
    },
    /// A discovery round finished.
    ServicesDiscovered {
        /// Session the discovery ran in.
        session: SessionId,
        /// What was found.
        outcome: DiscoveryOutcome,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// Session the read ran in.
        session: SessionId,
        /// Characteristic that was read.
        characteristic: Uuid,
        /// The value, or a description of the failure.
        result: std::result::Result<Bytes, String>,
    },
    /// A notification arrived.
    Notification {
        /// Session the subscription belongs to.
        session: SessionId,
        /// Characteristic that notified.
        characteristic: Uuid,
        /// The notified value.
        value: Bytes,
    },
    /// The wake scan saw an advertisement from `address`.
    Advertisement {
        /// Address of the advertiser.
        address: String,
    },
    /// The adapter was switched on or off.
    AdapterPowered(bool),
}

impl RadioEvent {
    /// The session this event is tagged with, if it belongs to one.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Connected { session }
            | Self::Disconnected { session, .. }
            | Self::ServicesDiscovered { session, .. }
            | Self::CharacteristicRead { session, .. }
            | Self::Notification { session, .. } => Some(*session),
            Self::Advertisement { .. } | Self::AdapterPowered(_) => None,
        }
    }
}

/// Platform BLE primitives consumed by the connection manager.
///
/// Implementations must not block: each request is queued and its outcome
/// reported later as a [`RadioEvent`]. An `Err` return means the request was
/// rejected outright and no event will follow.
pub trait RadioLink: Send {
    /// Open a link to `device`, tagging all resulting events with `session`.
    ///
    /// With `auto_reconnect` set the stack may keep retrying at the radio
    /// layer until the peripheral shows up.
    fn connect(&mut self, session: SessionId, device: &DeviceId, auto_reconnect: bool)
        -> Result<()>;

    /// Disconnect and release the current session. Best-effort.
    fn disconnect(&mut self) -> Result<()>;

    /// Discover services on the current link.
    fn discover_services(&mut self, session: SessionId) -> Result<()>;

    /// Read the characteristic referenced by `handle`.
    fn read_characteristic(&mut self, handle: &CharacteristicHandle) -> Result<()>;

    /// Enable notifications for `handle`. Best-effort.
    fn subscribe(&mut self, handle: &CharacteristicHandle) -> Result<()>;

    /// Ask the stack to drop its cached service table. Best-effort.
    fn refresh_service_cache(&mut self) -> bool;

    /// Start a passive scan filtered to `device`.
    fn start_scan(&mut self, device: &DeviceId, duration: Duration) -> Result<()>;

    /// Stop a running scan.
    fn stop_scan(&mut self) -> Result<()>;

    /// Request a larger MTU. Best-effort.
    fn request_mtu(&mut self, mtu: u16) -> Result<()>;

    /// Ask for a short connection interval. Best-effort.
    fn request_high_priority(&mut self) -> Result<()>;
}
