//! In-memory radio.
//!
//! A [`LoopbackRadio`] connects centrals and peripherals living in the same
//! process. Centrals implement [`TransportAdapter`] and peripherals
//! implement [`Advertiser`], so the whole demo flow can run without
//! hardware. Every command answers synchronously by posting into the
//! central's [`EventSink`].
//!
//! Peripherals can be made unresponsive to exercise deadlines: an
//! unresponsive peripheral never answers connect or discovery requests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::advertiser::Advertiser;
use crate::ble::transport::{AdapterEvent, EventSink, RequestId, TransportAdapter};
use crate::ble::types::{
    AdvertisementData, CharacteristicDescriptor, CharacteristicProperties, PeripheralHandle,
    PeripheralId, RadioState, ServiceDescriptor,
};
use crate::error::{Error, Result};

struct VirtualService {
    uuid: Uuid,
    characteristics: Vec<(Uuid, Bytes)>,
}

struct VirtualPeripheral {
    name: String,
    rssi: i16,
    responsive: bool,
    advertising: bool,
    service: Option<VirtualService>,
}

impl VirtualPeripheral {
    fn handle(&self, id: &PeripheralId) -> PeripheralHandle {
        PeripheralHandle::new(
            id.clone(),
            AdvertisementData {
                local_name: Some(self.name.clone()),
                service_uuids: self.service.iter().map(|s| s.uuid).collect(),
                ..Default::default()
            },
            Some(self.rssi),
        )
    }
}

struct CentralLink {
    sink: EventSink,
    scan_filter: Option<Vec<Uuid>>,
    connected: HashSet<PeripheralId>,
    subscriptions: HashSet<(PeripheralId, Uuid)>,
}

impl CentralLink {
    fn drop_link(&mut self, peripheral: &PeripheralId) -> bool {
        self.subscriptions.retain(|(p, _)| p != peripheral);
        self.connected.remove(peripheral)
    }
}

struct RadioInner {
    state: RadioState,
    next_peripheral: u64,
    centrals: Vec<CentralLink>,
    peripherals: HashMap<PeripheralId, VirtualPeripheral>,
}

impl RadioInner {
    /// Report an advertising peripheral to every scanning central it matches.
    fn announce(&self, id: &PeripheralId) {
        let Some(peripheral) = self.peripherals.get(id).filter(|p| p.advertising) else {
            return;
        };
        let handle = peripheral.handle(id);

        for central in &self.centrals {
            if let Some(filter) = &central.scan_filter {
                if handle.advertisement.advertises_any(filter) {
                    central
                        .sink
                        .deliver(AdapterEvent::PeripheralDiscovered(handle.clone()));
                }
            }
        }
    }

    fn answering(&self, id: &PeripheralId) -> Option<&VirtualPeripheral> {
        self.peripherals.get(id).filter(|p| p.responsive)
    }
}

/// A shared in-process radio.
#[derive(Clone)]
pub struct LoopbackRadio {
    inner: Arc<Mutex<RadioInner>>,
}

impl LoopbackRadio {
    /// Create a powered-on radio.
    pub fn new() -> Self {
        Self::with_state(RadioState::PoweredOn)
    }

    /// Create a radio in the given state.
    pub fn with_state(state: RadioState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RadioInner {
                state,
                next_peripheral: 0,
                centrals: Vec::new(),
                peripherals: HashMap::new(),
            })),
        }
    }

    /// Current radio state.
    pub fn state(&self) -> RadioState {
        self.inner.lock().state
    }

    /// Change the radio state and report it to every central.
    ///
    /// Leaving the powered-on state drops all links, scans and
    /// advertisements without further events.
    pub fn set_power(&self, state: RadioState) {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return;
        }
        inner.state = state;
        debug!("Loopback radio is now {}", state);

        if !state.is_powered_on() {
            for central in &mut inner.centrals {
                central.scan_filter = None;
                central.connected.clear();
                central.subscriptions.clear();
            }
            for peripheral in inner.peripherals.values_mut() {
                peripheral.advertising = false;
            }
        }

        for central in &inner.centrals {
            central.sink.deliver(AdapterEvent::RadioStateChanged(state));
        }
    }

    /// Attach a central that posts into `sink`.
    pub fn central(&self, sink: EventSink) -> LoopbackTransport {
        let mut inner = self.inner.lock();
        inner.centrals.push(CentralLink {
            sink,
            scan_filter: None,
            connected: HashSet::new(),
            subscriptions: HashSet::new(),
        });

        LoopbackTransport {
            inner: self.inner.clone(),
            index: inner.centrals.len() - 1,
        }
    }

    /// Attach a peripheral advertising under `name` at the given signal strength.
    pub fn peripheral(&self, name: &str, rssi: i16) -> LoopbackPeripheral {
        let mut inner = self.inner.lock();
        inner.next_peripheral += 1;
        let id = PeripheralId::new(format!("loopback-{}", inner.next_peripheral));
        inner.peripherals.insert(
            id.clone(),
            VirtualPeripheral {
                name: name.to_string(),
                rssi,
                responsive: true,
                advertising: false,
                service: None,
            },
        );

        LoopbackPeripheral {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

/// Central role on a [`LoopbackRadio`].
pub struct LoopbackTransport {
    inner: Arc<Mutex<RadioInner>>,
    index: usize,
}

impl LoopbackTransport {
    fn with_link<R>(&self, f: impl FnOnce(&RadioInner, &CentralLink) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner, &inner.centrals[self.index])
    }

    /// Check if the radio-level link to a peripheral is up.
    pub fn is_linked(&self, peripheral: &PeripheralId) -> bool {
        self.with_link(|_, link| link.connected.contains(peripheral))
    }

    /// Check if this central is scanning.
    pub fn is_scanning(&self) -> bool {
        self.with_link(|_, link| link.scan_filter.is_some())
    }
}

impl TransportAdapter for LoopbackTransport {
    fn power_state(&self) -> RadioState {
        self.inner.lock().state
    }

    fn start_scan(&self, service_uuids: &[Uuid]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.state.is_powered_on() {
            inner.centrals[self.index]
                .sink
                .deliver(AdapterEvent::ScanFailed {
                    reason: format!("radio is {}", inner.state),
                });
            return;
        }

        inner.centrals[self.index].scan_filter = Some(service_uuids.to_vec());
        let advertising: Vec<PeripheralId> = inner
            .peripherals
            .iter()
            .filter(|(_, p)| p.advertising)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &advertising {
            inner.announce(id);
        }
    }

    fn stop_scan(&self) {
        self.inner.lock().centrals[self.index].scan_filter = None;
    }

    fn connect(&self, peripheral: &PeripheralId) {
        let mut inner = self.inner.lock();
        if !inner.state.is_powered_on() || inner.answering(peripheral).is_none() {
            trace!("Connect to {} goes unanswered", peripheral);
            return;
        }

        let link = &mut inner.centrals[self.index];
        link.connected.insert(peripheral.clone());
        link.sink.deliver(AdapterEvent::Connected {
            peripheral: peripheral.clone(),
        });
    }

    fn cancel_connect(&self, peripheral: &PeripheralId) {
        self.inner.lock().centrals[self.index].drop_link(peripheral);
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        let mut inner = self.inner.lock();
        let link = &mut inner.centrals[self.index];
        link.drop_link(peripheral);
        link.sink.deliver(AdapterEvent::Disconnected {
            peripheral: peripheral.clone(),
            error: None,
        });
    }

    fn discover_services(&self, request: RequestId, peripheral: &PeripheralId, uuids: &[Uuid]) {
        self.with_link(|inner, link| {
            let Some(virtual_peripheral) = inner.answering(peripheral) else {
                return;
            };

            let result = if link.connected.contains(peripheral) {
                Ok(virtual_peripheral
                    .service
                    .iter()
                    .filter(|s| uuids.is_empty() || uuids.contains(&s.uuid))
                    .map(|s| ServiceDescriptor::new(s.uuid, peripheral.clone()))
                    .collect())
            } else {
                Err(format!("not connected to {}", peripheral))
            };

            link.sink.deliver(AdapterEvent::ServicesDiscovered {
                request,
                peripheral: peripheral.clone(),
                result,
            });
        });
    }

    fn discover_characteristics(
        &self,
        request: RequestId,
        service: &ServiceDescriptor,
        uuids: &[Uuid],
    ) {
        self.with_link(|inner, link| {
            let Some(virtual_peripheral) = inner.answering(&service.peripheral) else {
                return;
            };

            let result = if link.connected.contains(&service.peripheral) {
                Ok(virtual_peripheral
                    .service
                    .iter()
                    .filter(|s| s.uuid == service.uuid)
                    .flat_map(|s| s.characteristics.iter())
                    .filter(|(uuid, _)| uuids.is_empty() || uuids.contains(uuid))
                    .map(|(uuid, value)| {
                        let mut descriptor = CharacteristicDescriptor::new(
                            *uuid,
                            service.uuid,
                            service.peripheral.clone(),
                            CharacteristicProperties::READ_NOTIFY,
                        );
                        descriptor.value = value.clone();
                        descriptor
                    })
                    .collect())
            } else {
                Err(format!("not connected to {}", service.peripheral))
            };

            link.sink.deliver(AdapterEvent::CharacteristicsDiscovered {
                request,
                peripheral: service.peripheral.clone(),
                service_uuid: service.uuid,
                result,
            });
        });
    }

    fn subscribe(&self, characteristic: &CharacteristicDescriptor) {
        let mut inner = self.inner.lock();
        let link = &mut inner.centrals[self.index];
        if !link.connected.contains(&characteristic.peripheral) {
            link.sink.deliver(AdapterEvent::PeripheralFault {
                peripheral: characteristic.peripheral.clone(),
                reason: "subscribe on a dropped link".to_string(),
            });
            return;
        }

        link.subscriptions
            .insert((characteristic.peripheral.clone(), characteristic.uuid));
    }
}

/// Peripheral role on a [`LoopbackRadio`].
#[derive(Clone)]
pub struct LoopbackPeripheral {
    inner: Arc<Mutex<RadioInner>>,
    id: PeripheralId,
}

impl LoopbackPeripheral {
    /// Identifier centrals see for this peripheral.
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Make the peripheral ignore connect and discovery requests.
    pub fn set_responsive(&self, responsive: bool) {
        if let Some(peripheral) = self.inner.lock().peripherals.get_mut(&self.id) {
            peripheral.responsive = responsive;
        }
    }

    /// Drop every link to this peripheral, as if it walked out of range.
    pub fn drop_links(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        for central in &mut inner.centrals {
            if central.drop_link(&self.id) {
                central.sink.deliver(AdapterEvent::Disconnected {
                    peripheral: self.id.clone(),
                    error: None,
                });
                dropped += 1;
            }
        }
        dropped
    }
}

#[async_trait]
impl Advertiser for LoopbackPeripheral {
    async fn start_advertising(&self, service: Uuid, characteristics: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.is_powered_on() {
            return Err(Error::NotPoweredOn { state: inner.state });
        }

        let peripheral = inner
            .peripherals
            .get_mut(&self.id)
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: self.id.to_string(),
            })?;
        peripheral.service = Some(VirtualService {
            uuid: service,
            characteristics: characteristics
                .iter()
                .map(|uuid| (*uuid, Bytes::new()))
                .collect(),
        });
        peripheral.advertising = true;
        debug!("{} advertising service {}", self.id, service);

        inner.announce(&self.id);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        if let Some(peripheral) = self.inner.lock().peripherals.get_mut(&self.id) {
            peripheral.advertising = false;
        }
        Ok(())
    }

    async fn notify_subscribers(&self, characteristic: Uuid, value: Bytes) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let service = inner
            .peripherals
            .get_mut(&self.id)
            .and_then(|p| p.service.as_mut())
            .ok_or(Error::NotAdvertising)?;
        let slot = service
            .characteristics
            .iter_mut()
            .find(|(uuid, _)| *uuid == characteristic)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })?;
        slot.1 = value.clone();
        let service_uuid = service.uuid;

        let key = (self.id.clone(), characteristic);
        let mut notified = 0;
        for central in &inner.centrals {
            if central.subscriptions.contains(&key) {
                central.sink.deliver(AdapterEvent::ValueChanged {
                    peripheral: self.id.clone(),
                    service_uuid,
                    characteristic_uuid: characteristic,
                    value: value.clone(),
                });
                notified += 1;
            }
        }

        trace!("{} notified {} centrals", characteristic, notified);
        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::EventQueue;
    use crate::ble::uuids::{CHARACTERISTIC_UUIDS, CHARACTERISTIC_UUID_1, SERVICE_UUID};
    use crate::session::SessionEvent;

    fn next_event(queue: &mut EventQueue) -> Option<AdapterEvent> {
        match queue.rx.try_recv() {
            Ok(SessionEvent::Adapter(event)) => Some(event),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_scan_reports_advertising_peripheral() {
        let radio = LoopbackRadio::new();
        let mut queue = EventQueue::new();
        let central = radio.central(queue.sink());
        let peripheral = radio.peripheral("Test", -50);

        peripheral
            .start_advertising(SERVICE_UUID, &CHARACTERISTIC_UUIDS)
            .await
            .unwrap();
        assert!(next_event(&mut queue).is_none());

        central.start_scan(&[SERVICE_UUID]);
        match next_event(&mut queue) {
            Some(AdapterEvent::PeripheralDiscovered(handle)) => {
                assert_eq!(handle.id, *peripheral.id());
                assert_eq!(handle.local_name(), Some("Test"));
                assert_eq!(handle.rssi, Some(-50));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scan_filter_excludes_other_services() {
        let radio = LoopbackRadio::new();
        let mut queue = EventQueue::new();
        let central = radio.central(queue.sink());
        let peripheral = radio.peripheral("Other", -70);
        peripheral
            .start_advertising(Uuid::from_u128(1), &[])
            .await
            .unwrap();

        central.start_scan(&[SERVICE_UUID]);
        assert!(next_event(&mut queue).is_none());
    }

    #[tokio::test]
    async fn test_unresponsive_peripheral_never_answers_connect() {
        let radio = LoopbackRadio::new();
        let mut queue = EventQueue::new();
        let central = radio.central(queue.sink());
        let peripheral = radio.peripheral("Test", -50);
        peripheral.set_responsive(false);

        central.connect(peripheral.id());
        assert!(next_event(&mut queue).is_none());
        assert!(!central.is_linked(peripheral.id()));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers_only() {
        let radio = LoopbackRadio::new();
        let mut queue = EventQueue::new();
        let central = radio.central(queue.sink());
        let peripheral = radio.peripheral("Test", -50);
        peripheral
            .start_advertising(SERVICE_UUID, &CHARACTERISTIC_UUIDS)
            .await
            .unwrap();

        central.connect(peripheral.id());
        assert!(matches!(
            next_event(&mut queue),
            Some(AdapterEvent::Connected { .. })
        ));
        assert_eq!(
            peripheral
                .notify_subscribers(CHARACTERISTIC_UUID_1, Bytes::from_static(b"01"))
                .await
                .unwrap(),
            0
        );

        let descriptor = CharacteristicDescriptor::new(
            CHARACTERISTIC_UUID_1,
            SERVICE_UUID,
            peripheral.id().clone(),
            CharacteristicProperties::READ_NOTIFY,
        );
        central.subscribe(&descriptor);
        assert_eq!(
            peripheral
                .notify_subscribers(CHARACTERISTIC_UUID_1, Bytes::from_static(b"02"))
                .await
                .unwrap(),
            1
        );
        match next_event(&mut queue) {
            Some(AdapterEvent::ValueChanged { value, .. }) => assert_eq!(&value[..], b"02"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_power_off_stops_advertising() {
        let radio = LoopbackRadio::new();
        let mut queue = EventQueue::new();
        let _central = radio.central(queue.sink());
        let peripheral = radio.peripheral("Test", -50);

        radio.set_power(RadioState::PoweredOff);
        assert_eq!(
            next_event(&mut queue),
            Some(AdapterEvent::RadioStateChanged(RadioState::PoweredOff))
        );
        assert!(matches!(
            peripheral.start_advertising(SERVICE_UUID, &[]).await,
            Err(Error::NotPoweredOn { .. })
        ));
    }
}
