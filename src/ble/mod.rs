//! BLE radio module.
//!
//! This module defines the transport adapter seam between the session core
//! and a radio stack, the descriptor types flowing across it, and two
//! radios: the host adapter via `btleplug` and an in-memory loopback.

pub mod advertiser;
pub mod loopback;
pub mod platform;
pub mod transport;
pub mod types;
pub mod uuids;

pub use advertiser::Advertiser;
pub use loopback::{LoopbackPeripheral, LoopbackRadio, LoopbackTransport};
pub use platform::BtleplugTransport;
pub use transport::{AdapterEvent, EventQueue, EventSink, RequestId, TransportAdapter};
pub use types::{
    AdvertisementData, CharacteristicDescriptor, CharacteristicProperties, PeripheralHandle,
    PeripheralId, RadioState, ServiceDescriptor,
};
pub use uuids::*;
