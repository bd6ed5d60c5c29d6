//! Error types for the sense-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The sensor has not been seen by the adapter yet.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a link but the sensor is not connected.
    #[error("Sensor not connected")]
    NotConnected,

    /// No device identity was supplied and none was persisted.
    #[error("No device identity known")]
    NoDeviceIdentity,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The requested operation is not supported by this radio backend.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The persisted state could not be written or read.
    #[error("Storage error: {reason}")]
    Storage {
        /// Description of what went wrong.
        reason: String,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The service task has shut down and no longer accepts commands.
    #[error("Service stopped")]
    ServiceStopped,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
