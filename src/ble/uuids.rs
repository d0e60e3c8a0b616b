//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants the peripheral registers and advertises.

use uuid::Uuid;

const BASE_UUID_BITS: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit short UUID onto the Bluetooth SIG base UUID.
const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID_BITS | ((short as u128) << 96))
}

// Status Service (custom, built on the SIG base)
/// Status service UUID.
pub const STATUS_SERVICE_UUID: Uuid = from_short(0xa000);
/// Status characteristic UUID (Read, Write, Notify).
pub const STATUS_CHARACTERISTIC_UUID: Uuid = from_short(0xa001);
