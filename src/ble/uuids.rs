//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identifiers the broadcaster advertises and the listener
//! looks for. They are fixed at build time; the session core never
//! computes them.

use uuid::Uuid;

/// Bluetooth Base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number onto the Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Name the broadcaster advertises.
pub const SERVICE_NAME: &str = "Test";

/// Demo service UUID (`7e57`).
pub const SERVICE_UUID: Uuid = uuid_from_u16(0x7e57);
/// First demo characteristic UUID (`b71e`, Read, Notify).
pub const CHARACTERISTIC_UUID_1: Uuid = uuid_from_u16(0xb71e);
/// Second demo characteristic UUID (`b72e`, Read, Notify).
pub const CHARACTERISTIC_UUID_2: Uuid = uuid_from_u16(0xb72e);

/// All characteristics exposed by the demo service.
pub const CHARACTERISTIC_UUIDS: [Uuid; 2] = [CHARACTERISTIC_UUID_1, CHARACTERISTIC_UUID_2];
