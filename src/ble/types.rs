//! Radio, peripheral, service and characteristic descriptors.
//!
//! These are produced by a [`TransportAdapter`](crate::ble::TransportAdapter)
//! and only referenced by the session core. Back-references are held as
//! identifiers, never as owning pointers, so a descriptor stays harmless
//! after the peripheral it came from has gone away.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Power/authorization state reported by the platform radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// State not yet known.
    #[default]
    Unknown,
    /// The radio stack is restarting.
    Resetting,
    /// The platform has no BLE central support.
    Unsupported,
    /// The application may not use Bluetooth.
    Unauthorized,
    /// Bluetooth is switched off.
    PoweredOff,
    /// Ready for use.
    PoweredOn,
}

impl RadioState {
    /// Check if operations may start.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Opaque peripheral identifier assigned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Advertisement payload seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer-specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
}

impl AdvertisementData {
    /// Check if any of `uuids` is advertised. An empty filter matches everything.
    pub fn advertises_any(&self, uuids: &[Uuid]) -> bool {
        uuids.is_empty() || uuids.iter().any(|u| self.service_uuids.contains(u))
    }
}

/// A peripheral found by a scan.
///
/// Immutable once created; a newer advertisement produces a new handle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    /// Adapter identifier.
    pub id: PeripheralId,
    /// Advertisement metadata.
    pub advertisement: AdvertisementData,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When the advertisement was received.
    pub discovered_at: DateTime<Utc>,
}

impl PeripheralHandle {
    /// Create a handle stamped with the current time.
    pub fn new(id: PeripheralId, advertisement: AdvertisementData, rssi: Option<i16>) -> Self {
        Self {
            id,
            advertisement,
            rssi,
            discovered_at: Utc::now(),
        }
    }

    /// The advertised local name, if any.
    pub fn local_name(&self) -> Option<&str> {
        self.advertisement.local_name.as_deref()
    }
}

/// GATT characteristic properties relevant to the listener role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    /// Value may be read.
    pub read: bool,
    /// Value may be written with response.
    pub write: bool,
    /// Value may be written without response.
    pub write_without_response: bool,
    /// Value changes are notified.
    pub notify: bool,
    /// Value changes are indicated.
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Readable and notifying, the shape of the demo characteristics.
    pub const READ_NOTIFY: Self = Self {
        read: true,
        write: false,
        write_without_response: false,
        notify: true,
        indicate: false,
    };

    /// Check if value changes can be subscribed to.
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic discovered on a service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Peripheral the owning service lives on.
    pub peripheral: PeripheralId,
    /// Declared properties.
    pub properties: CharacteristicProperties,
    /// Latest known value.
    pub value: Bytes,
    /// Whether value changes are being delivered.
    pub subscribed: bool,
}

impl CharacteristicDescriptor {
    /// Create a descriptor with an empty value.
    pub fn new(
        uuid: Uuid,
        service_uuid: Uuid,
        peripheral: PeripheralId,
        properties: CharacteristicProperties,
    ) -> Self {
        Self {
            uuid,
            service_uuid,
            peripheral,
            properties,
            value: Bytes::new(),
            subscribed: false,
        }
    }
}

/// A service discovered on a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Peripheral the service lives on.
    pub peripheral: PeripheralId,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Characteristics discovered so far.
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Create a primary service with no characteristics discovered yet.
    pub fn new(uuid: Uuid, peripheral: PeripheralId) -> Self {
        Self {
            uuid,
            peripheral,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    /// Find a discovered characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{CHARACTERISTIC_UUID_1, SERVICE_UUID};

    #[test]
    fn test_radio_state() {
        assert!(RadioState::PoweredOn.is_powered_on());
        assert!(!RadioState::PoweredOff.is_powered_on());
        assert!(!RadioState::Unauthorized.is_powered_on());
        assert_eq!(RadioState::default(), RadioState::Unknown);
        assert_eq!(format!("{}", RadioState::Resetting), "Resetting");
    }

    #[test]
    fn test_advertises_any() {
        let adv = AdvertisementData {
            service_uuids: vec![SERVICE_UUID],
            ..Default::default()
        };
        assert!(adv.advertises_any(&[]));
        assert!(adv.advertises_any(&[SERVICE_UUID]));
        assert!(!adv.advertises_any(&[CHARACTERISTIC_UUID_1]));
    }

    #[test]
    fn test_service_characteristic_lookup() {
        let peripheral = PeripheralId::new("p1");
        let mut service = ServiceDescriptor::new(SERVICE_UUID, peripheral.clone());
        service.characteristics.push(CharacteristicDescriptor::new(
            CHARACTERISTIC_UUID_1,
            SERVICE_UUID,
            peripheral,
            CharacteristicProperties::READ_NOTIFY,
        ));

        let found = service.characteristic(&CHARACTERISTIC_UUID_1).unwrap();
        assert!(found.properties.can_subscribe());
        assert!(found.value.is_empty());
        assert!(service.characteristic(&SERVICE_UUID).is_none());
    }
}
