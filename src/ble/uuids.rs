//! BLE Service and Characteristic UUIDs.
//!
//! Contains the fixed identifiers of the SensePi device profile.

use uuid::Uuid;

// SensePi Service (Nordic UART base)
/// SensePi service UUID.
pub const SENSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// INFO characteristic UUID (Read, Notify). Carries presence + battery JSON.
pub const INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0004_b5a3_f393_e0a9_e50e24dcca9e);

/// MTU requested right after the link comes up.
pub const REQUESTED_MTU: u16 = 185;

/// Check if a characteristic UUID is the INFO characteristic.
pub fn is_info_characteristic(uuid: &Uuid) -> bool {
    *uuid == INFO_CHARACTERISTIC_UUID
}
