//! Host radio binding.
//!
//! [`BtleplugTransport`] implements [`TransportAdapter`] on top of the
//! host's first Bluetooth adapter. Every command is handed to a task on
//! the runtime captured at construction, and its outcome is posted to the
//! session queue as an [`AdapterEvent`].

use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{AdapterEvent, EventSink, RequestId, TransportAdapter};
use crate::ble::types::{
    AdvertisementData, CharacteristicDescriptor, CharacteristicProperties, PeripheralHandle,
    PeripheralId, RadioState, ServiceDescriptor,
};
use crate::error::{Error, Result};

impl From<CharPropFlags> for CharacteristicProperties {
    fn from(flags: CharPropFlags) -> Self {
        Self {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        }
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        #[allow(unreachable_patterns)]
        _ => RadioState::Unknown,
    }
}

fn characteristic_descriptor(
    peripheral: &PeripheralId,
    characteristic: &Characteristic,
) -> CharacteristicDescriptor {
    CharacteristicDescriptor::new(
        characteristic.uuid,
        characteristic.service_uuid,
        peripheral.clone(),
        characteristic.properties.into(),
    )
}

/// State shared between the transport and its background tasks.
struct Shared {
    adapter: Adapter,
    sink: EventSink,
    /// Last reported radio state.
    state: RwLock<RadioState>,
    /// Service filter of the active scan, `None` when not scanning.
    scan_filter: RwLock<Option<Vec<Uuid>>>,
    /// Peripherals seen by the adapter.
    peripherals: RwLock<HashMap<PeripheralId, Peripheral>>,
    /// In-flight connection attempts.
    connecting: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    /// Notification stream readers, one per connected peripheral.
    notification_pumps: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    /// Subscribed characteristics mapped to their service.
    subscriptions: RwLock<HashMap<(PeripheralId, Uuid), Uuid>>,
}

/// [`TransportAdapter`] backed by `btleplug`.
pub struct BtleplugTransport {
    shared: Arc<Shared>,
    runtime: Handle,
    event_pump: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the host's first Bluetooth adapter.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(sink: EventSink) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        Self::with_adapter(adapter, sink).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter, sink: EventSink) -> Result<Self> {
        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let state = match adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                warn!("Could not read adapter state: {}", e);
                RadioState::Unknown
            }
        };
        let events = adapter.events().await.map_err(Error::Bluetooth)?;

        let shared = Arc::new(Shared {
            adapter,
            sink,
            state: RwLock::new(state),
            scan_filter: RwLock::new(None),
            peripherals: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            notification_pumps: Mutex::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        });

        let pump_shared = shared.clone();
        let event_pump = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                Self::handle_event(&pump_shared, event).await;
            }
            debug!("Adapter event stream ended");
        });

        Ok(Self {
            shared,
            runtime: Handle::current(),
            event_pump,
        })
    }

    /// Handle a BLE central event.
    async fn handle_event(shared: &Arc<Shared>, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. }
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                Self::process_peripheral(shared, id).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                let peripheral = PeripheralId::new(id.to_string());
                debug!("Device disconnected: {}", peripheral);
                if let Some(pump) = shared.notification_pumps.lock().remove(&peripheral) {
                    pump.abort();
                }
                shared
                    .subscriptions
                    .write()
                    .retain(|(p, _), _| *p != peripheral);
                shared.sink.deliver(AdapterEvent::Disconnected {
                    peripheral,
                    error: None,
                });
            }
            CentralEvent::StateUpdate(state) => {
                let state = radio_state(state);
                *shared.state.write() = state;
                info!("Radio state changed: {}", state);
                shared.sink.deliver(AdapterEvent::RadioStateChanged(state));
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    /// Report a peripheral to an active scan.
    async fn process_peripheral(shared: &Arc<Shared>, id: btleplug::platform::PeripheralId) {
        let Some(filter) = shared.scan_filter.read().clone() else {
            return;
        };

        let peripheral = match shared.adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let advertisement = AdvertisementData {
            local_name: properties.local_name,
            service_uuids: properties.services,
            manufacturer_data: properties.manufacturer_data,
            tx_power_level: properties.tx_power_level,
        };
        if !advertisement.advertises_any(&filter) {
            return;
        }

        let identifier = PeripheralId::new(id.to_string());
        shared
            .peripherals
            .write()
            .insert(identifier.clone(), peripheral);

        shared
            .sink
            .deliver(AdapterEvent::PeripheralDiscovered(PeripheralHandle::new(
                identifier,
                advertisement,
                properties.rssi,
            )));
    }

    fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.shared.peripherals.read().get(id).cloned()
    }

    /// Start forwarding notifications of a peripheral, once.
    fn ensure_notification_pump(&self, id: &PeripheralId, peripheral: Peripheral) {
        let mut pumps = self.shared.notification_pumps.lock();
        if pumps.contains_key(id) {
            return;
        }

        let shared = self.shared.clone();
        let id = id.clone();
        let pump_id = id.clone();
        let handle = self.runtime.spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    shared.sink.deliver(AdapterEvent::PeripheralFault {
                        peripheral: pump_id,
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let service_uuid = shared
                    .subscriptions
                    .read()
                    .get(&(pump_id.clone(), notification.uuid))
                    .copied();
                let Some(service_uuid) = service_uuid else {
                    trace!("Notification from unsubscribed {}", notification.uuid);
                    continue;
                };

                shared.sink.deliver(AdapterEvent::ValueChanged {
                    peripheral: pump_id.clone(),
                    service_uuid,
                    characteristic_uuid: notification.uuid,
                    value: Bytes::from(notification.value),
                });
            }

            debug!("Notification stream of {} ended", pump_id);
        });

        pumps.insert(id, handle);
    }
}

impl TransportAdapter for BtleplugTransport {
    fn power_state(&self) -> RadioState {
        *self.shared.state.read()
    }

    fn start_scan(&self, service_uuids: &[Uuid]) {
        *self.shared.scan_filter.write() = Some(service_uuids.to_vec());

        let shared = self.shared.clone();
        let filter = ScanFilter {
            services: service_uuids.to_vec(),
        };
        self.runtime.spawn(async move {
            if let Err(e) = shared.adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
                *shared.scan_filter.write() = None;
                shared.sink.deliver(AdapterEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
    }

    fn stop_scan(&self) {
        if self.shared.scan_filter.write().take().is_none() {
            return;
        }

        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        });
    }

    fn connect(&self, id: &PeripheralId) {
        let Some(peripheral) = self.peripheral(id) else {
            self.shared.sink.deliver(AdapterEvent::ConnectFailed {
                peripheral: id.clone(),
                reason: "peripheral not seen by this adapter".to_string(),
            });
            return;
        };

        let shared = self.shared.clone();
        let id = id.clone();
        let task_id = id.clone();
        let handle = self.runtime.spawn(async move {
            let result = if peripheral.is_connected().await.unwrap_or(false) {
                info!("Peripheral {} already connected at BLE level", task_id);
                Ok(())
            } else {
                peripheral.connect().await
            };

            shared.connecting.lock().remove(&task_id);
            match result {
                Ok(()) => {
                    shared.sink.deliver(AdapterEvent::Connected {
                        peripheral: task_id,
                    });
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", task_id, e);
                    shared.sink.deliver(AdapterEvent::ConnectFailed {
                        peripheral: task_id,
                        reason: e.to_string(),
                    });
                }
            }
        });

        if let Some(previous) = self.shared.connecting.lock().insert(id, handle) {
            previous.abort();
        }
    }

    fn cancel_connect(&self, id: &PeripheralId) {
        if let Some(attempt) = self.shared.connecting.lock().remove(id) {
            attempt.abort();
        }

        if let Some(peripheral) = self.peripheral(id) {
            self.runtime.spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
    }

    fn disconnect(&self, id: &PeripheralId) {
        let Some(peripheral) = self.peripheral(id) else {
            self.shared.sink.deliver(AdapterEvent::Disconnected {
                peripheral: id.clone(),
                error: None,
            });
            return;
        };

        let shared = self.shared.clone();
        let id = id.clone();
        self.runtime.spawn(async move {
            let error = match peripheral.disconnect().await {
                Ok(()) => {
                    info!("Successfully disconnected from {}", id);
                    None
                }
                Err(e) => {
                    error!("Failed to disconnect from {}: {}", id, e);
                    Some(e.to_string())
                }
            };

            if let Some(pump) = shared.notification_pumps.lock().remove(&id) {
                pump.abort();
            }
            shared.sink.deliver(AdapterEvent::Disconnected {
                peripheral: id,
                error,
            });
        });
    }

    fn discover_services(&self, request: RequestId, id: &PeripheralId, _uuids: &[Uuid]) {
        let shared = self.shared.clone();
        let id = id.clone();
        let Some(peripheral) = self.peripheral(&id) else {
            shared.sink.deliver(AdapterEvent::ServicesDiscovered {
                request,
                peripheral: id,
                result: Err("peripheral not seen by this adapter".to_string()),
            });
            return;
        };

        self.runtime.spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|service| ServiceDescriptor {
                        uuid: service.uuid,
                        peripheral: id.clone(),
                        primary: service.primary,
                        characteristics: Vec::new(),
                    })
                    .collect()),
                Err(e) => Err(e.to_string()),
            };

            shared.sink.deliver(AdapterEvent::ServicesDiscovered {
                request,
                peripheral: id,
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
        let shared = self.shared.clone();
        let id = service.peripheral.clone();
        let service_uuid = service.uuid;
        let uuids = uuids.to_vec();
        let Some(peripheral) = self.peripheral(&id) else {
            shared.sink.deliver(AdapterEvent::CharacteristicsDiscovered {
                request,
                peripheral: id,
                service_uuid,
                result: Err("peripheral not seen by this adapter".to_string()),
            });
            return;
        };

        self.runtime.spawn(async move {
            // btleplug discovers characteristics together with services.
            if peripheral.services().is_empty() {
                if let Err(e) = peripheral.discover_services().await {
                    shared.sink.deliver(AdapterEvent::CharacteristicsDiscovered {
                        request,
                        peripheral: id,
                        service_uuid,
                        result: Err(e.to_string()),
                    });
                    return;
                }
            }

            let characteristics: Vec<Characteristic> = peripheral
                .services()
                .into_iter()
                .filter(|s| s.uuid == service_uuid)
                .flat_map(|s| s.characteristics.into_iter())
                .filter(|c| uuids.is_empty() || uuids.contains(&c.uuid))
                .collect();

            let mut descriptors = Vec::with_capacity(characteristics.len());
            for characteristic in &characteristics {
                let mut descriptor = characteristic_descriptor(&id, characteristic);
                if descriptor.properties.read {
                    match peripheral.read(characteristic).await {
                        Ok(value) => descriptor.value = Bytes::from(value),
                        Err(e) => trace!("Initial read of {} failed: {}", characteristic.uuid, e),
                    }
                }
                descriptors.push(descriptor);
            }

            debug!(
                "Discovered {} characteristics of {}",
                descriptors.len(),
                service_uuid
            );
            shared.sink.deliver(AdapterEvent::CharacteristicsDiscovered {
                request,
                peripheral: id,
                service_uuid,
                result: Ok(descriptors),
            });
        });
    }

    fn subscribe(&self, descriptor: &CharacteristicDescriptor) {
        let id = descriptor.peripheral.clone();
        let Some(peripheral) = self.peripheral(&id) else {
            return;
        };

        let Some(characteristic) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == descriptor.uuid && c.service_uuid == descriptor.service_uuid)
        else {
            self.shared.sink.deliver(AdapterEvent::PeripheralFault {
                peripheral: id,
                reason: format!("characteristic {} not found", descriptor.uuid),
            });
            return;
        };

        self.shared
            .subscriptions
            .write()
            .insert((id.clone(), descriptor.uuid), descriptor.service_uuid);
        self.ensure_notification_pump(&id, peripheral.clone());

        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            match peripheral.subscribe(&characteristic).await {
                Ok(()) => debug!("Subscribed to notifications from {}", characteristic.uuid),
                Err(e) => {
                    debug!("Failed to subscribe to {}: {:?}", characteristic.uuid, e);
                    shared.sink.deliver(AdapterEvent::PeripheralFault {
                        peripheral: id,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.event_pump.abort();
        for (_, handle) in self.shared.connecting.lock().drain() {
            handle.abort();
        }
        for (_, handle) in self.shared.notification_pumps.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_properties_from_flags() {
        let props: CharacteristicProperties = (CharPropFlags::READ | CharPropFlags::NOTIFY).into();
        assert_eq!(props, CharacteristicProperties::READ_NOTIFY);

        let props: CharacteristicProperties = CharPropFlags::WRITE_WITHOUT_RESPONSE.into();
        assert!(props.write_without_response);
        assert!(!props.can_subscribe());
    }

    #[test]
    fn test_radio_state_mapping() {
        assert_eq!(radio_state(CentralState::PoweredOn), RadioState::PoweredOn);
        assert_eq!(radio_state(CentralState::PoweredOff), RadioState::PoweredOff);
        assert_eq!(radio_state(CentralState::Unknown), RadioState::Unknown);
    }
}
