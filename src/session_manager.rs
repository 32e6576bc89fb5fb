//! Session manager: the object applications hold.
//!
//! Owns one [`SessionStateMachine`] and the task that drains the session
//! event queue. Commands take the machine lock, mutate it and return
//! immediately; completions arrive later on the queue. User callbacks
//! always run with the lock released, so they may issue further commands.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::platform::BtleplugTransport;
use crate::ble::transport::{EventQueue, TransportAdapter};
use crate::ble::types::{
    CharacteristicDescriptor, PeripheralHandle, PeripheralId, RadioState, ServiceDescriptor,
};
use crate::config::SessionConfig;
use crate::error::{DisconnectReason, Result, SessionError};
use crate::session::pending::{
    CharacteristicCallbacks, ConnectCallbacks, ScanCallbacks, ServiceCallbacks,
};
use crate::session::{SessionEvent, SessionPhase, SessionStateMachine};

/// Public facade over a central-role BLE session.
pub struct SessionManager<T: TransportAdapter + 'static> {
    /// The state machine, shared with the event loop.
    machine: Arc<Mutex<SessionStateMachine<T>>>,
    /// Handle to the event loop task.
    event_loop: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager<BtleplugTransport> {
    /// Create a manager on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn bluetooth(config: SessionConfig) -> Result<Self> {
        let queue = EventQueue::new();
        let transport = BtleplugTransport::new(queue.sink()).await?;
        Ok(Self::new(transport, queue, config))
    }
}

impl<T: TransportAdapter + 'static> SessionManager<T> {
    /// Create a manager over `transport`, which must post into `queue`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: T, queue: EventQueue, config: SessionConfig) -> Self {
        let EventQueue { tx, rx } = queue;
        let machine = Arc::new(Mutex::new(SessionStateMachine::new(transport, config, tx)));

        let handle = tokio::spawn(Self::run_event_loop(rx, machine.clone()));

        Self {
            machine,
            event_loop: RwLock::new(Some(handle)),
        }
    }

    /// Process queue entries one at a time until the manager goes away.
    async fn run_event_loop(
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
        machine: Arc<Mutex<SessionStateMachine<T>>>,
    ) {
        while let Some(event) = rx.recv().await {
            let dispatch = machine.lock().handle_event(event);
            dispatch.run();
        }

        debug!("Session event loop ended");
    }

    // === Commands ===

    /// Scan for a peripheral.
    ///
    /// `on_found` runs with the first matching peripheral and scanning
    /// stops. `on_timeout` runs if none is found within `timeout`, or
    /// immediately if the radio is not powered on. Calling this while a
    /// scan is in progress discards the earlier scan's callbacks.
    pub fn start_scan<F, E>(&self, timeout: Duration, on_found: F, on_timeout: E)
    where
        F: FnOnce(PeripheralHandle) + Send + 'static,
        E: FnOnce(SessionError) + Send + 'static,
    {
        let dispatch = self.machine.lock().start_scan(
            timeout,
            ScanCallbacks {
                on_found: Box::new(on_found),
                on_timeout: Box::new(on_timeout),
            },
        );
        dispatch.run();
    }

    /// Stop scanning. No scan callback runs. Idempotent.
    pub fn stop_scan(&self) {
        self.machine.lock().stop_scan();
    }

    /// Connect a peripheral.
    ///
    /// `on_connect` runs when the link is up; `on_disconnect` is kept for
    /// the lifetime of the connection and runs at most once;
    /// `on_timed_out` runs if the link is not up within `timeout`.
    pub fn connect<C, D, E>(
        &self,
        peripheral: &PeripheralHandle,
        timeout: Duration,
        on_connect: C,
        on_disconnect: D,
        on_timed_out: E,
    ) where
        C: FnOnce(PeripheralHandle) + Send + 'static,
        D: FnOnce(DisconnectReason) + Send + 'static,
        E: FnOnce(SessionError) + Send + 'static,
    {
        let dispatch = self.machine.lock().connect(
            timeout,
            ConnectCallbacks {
                peripheral: peripheral.clone(),
                on_connect: Box::new(on_connect),
                on_disconnect: Box::new(on_disconnect),
                on_timed_out: Box::new(on_timed_out),
            },
        );
        dispatch.run();
    }

    /// Disconnect a peripheral. Idempotent.
    pub fn disconnect(&self, peripheral: &PeripheralId) {
        let dispatch = self.machine.lock().disconnect(peripheral);
        dispatch.run();
    }

    /// Discover services on the connected peripheral.
    ///
    /// `on_found` receives only the peripheral; query
    /// [`discovered_services`](Self::discovered_services) for the services
    /// matching `uuids`.
    pub fn discover_services<F>(&self, peripheral: &PeripheralId, uuids: &[Uuid], on_found: F)
    where
        F: FnOnce(PeripheralHandle) + Send + 'static,
    {
        let dispatch = self.machine.lock().discover_services(
            peripheral,
            ServiceCallbacks {
                uuids: uuids.to_vec(),
                on_found: Box::new(on_found),
            },
        );
        dispatch.run();
    }

    /// Discover the characteristics of a service and subscribe to them.
    ///
    /// `on_found` runs once with the service and its characteristics
    /// matching `uuids`. `on_changed` then runs on every value change of a
    /// subscribed characteristic until the session ends. If `timeout`
    /// elapses first, neither runs.
    pub fn get_characteristics<F, C>(
        &self,
        service: &ServiceDescriptor,
        uuids: &[Uuid],
        timeout: Duration,
        on_found: F,
        on_changed: C,
    ) where
        F: FnOnce(ServiceDescriptor) + Send + 'static,
        C: Fn(&CharacteristicDescriptor) + Send + Sync + 'static,
    {
        let dispatch = self.machine.lock().get_characteristics(
            timeout,
            CharacteristicCallbacks {
                service: service.clone(),
                uuids: uuids.to_vec(),
                on_found: Box::new(on_found),
                on_changed: Arc::new(on_changed),
            },
        );
        dispatch.run();
    }

    // === Queries ===

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        self.machine.lock().phase()
    }

    /// Radio state as reported by the adapter.
    pub fn radio_state(&self) -> RadioState {
        self.machine.lock().radio_state()
    }

    /// The connected peripheral, if any.
    pub fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.machine.lock().connected_peripheral()
    }

    /// Services of the connected peripheral matching the last discovery.
    pub fn discovered_services(&self) -> Vec<ServiceDescriptor> {
        self.machine.lock().discovered_services()
    }

    /// Latest known state of a characteristic.
    pub fn characteristic(
        &self,
        service_uuid: &Uuid,
        characteristic_uuid: &Uuid,
    ) -> Option<CharacteristicDescriptor> {
        self.machine
            .lock()
            .characteristic(service_uuid, characteristic_uuid)
    }

    /// Run `f` against the transport adapter.
    pub fn with_transport<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(self.machine.lock().transport())
    }

    /// Clean shutdown: stop scanning, drop the connection and stop the
    /// event loop. Later scans and connects fail with
    /// [`SessionError::Closed`].
    pub async fn shutdown(&self) {
        info!("Shutting down session manager");

        let dispatch = self.machine.lock().shutdown();
        dispatch.run();

        let handle = self.event_loop.write().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl<T: TransportAdapter + 'static> Drop for SessionManager<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.write().take() {
            handle.abort();
        }
    }
}
