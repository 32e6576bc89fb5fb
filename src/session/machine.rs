//! The session state machine.
//!
//! Owns the phase, one pending-operation slot per phase and the
//! established session. Commands and events mutate it one at a time under
//! the manager's lock; user callbacks are never run here but collected
//! into a [`Dispatch`] that the caller runs after releasing the lock.
//!
//! Every handler that completes an operation cancels its deadline before
//! queueing the user callback, so a success and a timeout for the same
//! operation can never both fire.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::transport::{AdapterEvent, RequestId, TransportAdapter};
use crate::ble::types::{
    CharacteristicDescriptor, PeripheralHandle, PeripheralId, RadioState, ServiceDescriptor,
};
use crate::config::{ConnectPolicy, SessionConfig};
use crate::error::{DisconnectReason, SessionError};
use crate::logging::{session_debug, session_error};
use crate::session::pending::{
    ChangedCharacteristicFn, CharacteristicCallbacks, ConnectCallbacks, DisconnectFn, Dispatch,
    PendingOperation, ScanCallbacks, ServiceCallbacks,
};
use crate::session::phase::SessionPhase;
use crate::session::timer::{DeadlineId, DeadlineTimer};
use crate::session::SessionEvent;

/// An established connection.
struct ActiveSession {
    peripheral: PeripheralHandle,
    on_disconnect: Option<DisconnectFn>,
    services: Vec<ServiceDescriptor>,
    service_filter: Vec<Uuid>,
    subscriptions: HashMap<(Uuid, Uuid), ChangedCharacteristicFn>,
    /// Set once a disconnect was requested; the deadline bounds the wait.
    disconnecting: Option<DeadlineId>,
}

impl ActiveSession {
    fn new(peripheral: PeripheralHandle, on_disconnect: DisconnectFn) -> Self {
        Self {
            peripheral,
            on_disconnect: Some(on_disconnect),
            services: Vec::new(),
            service_filter: Vec::new(),
            subscriptions: HashMap::new(),
            disconnecting: None,
        }
    }

    fn is_for(&self, peripheral: &PeripheralId) -> bool {
        self.peripheral.id == *peripheral
    }

    fn is_established(&self) -> bool {
        self.disconnecting.is_none()
    }

    fn upsert_service(&mut self, service: ServiceDescriptor) {
        match self.services.iter_mut().find(|s| s.uuid == service.uuid) {
            Some(existing) => *existing = service,
            None => self.services.push(service),
        }
    }
}

/// Take the slot's content if it satisfies `pred`.
fn take_if<C>(slot: &mut Option<C>, pred: impl FnOnce(&C) -> bool) -> Option<C> {
    if slot.as_ref().map_or(false, pred) {
        slot.take()
    } else {
        None
    }
}

/// Central-role session state machine over a transport adapter.
pub struct SessionStateMachine<T> {
    transport: T,
    config: SessionConfig,
    deadlines: DeadlineTimer<SessionEvent>,
    phase: SessionPhase,
    next_request: u64,
    scan: Option<PendingOperation<ScanCallbacks>>,
    connect: Option<PendingOperation<ConnectCallbacks>>,
    services: Option<PendingOperation<ServiceCallbacks>>,
    characteristics: Option<PendingOperation<CharacteristicCallbacks>>,
    session: Option<ActiveSession>,
    /// Peripherals whose link was dropped with the disconnect still unconfirmed.
    unconfirmed: HashSet<PeripheralId>,
    closed: bool,
}

impl<T: TransportAdapter> SessionStateMachine<T> {
    /// Create an idle machine. Deadlines post into `queue`.
    pub fn new(
        transport: T,
        config: SessionConfig,
        queue: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            deadlines: DeadlineTimer::new(queue),
            phase: SessionPhase::Idle,
            next_request: 0,
            scan: None,
            connect: None,
            services: None,
            characteristics: None,
            session: None,
            unconfirmed: HashSet::new(),
            closed: false,
        }
    }

    // === Queries ===

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Radio state as reported by the adapter.
    pub fn radio_state(&self) -> RadioState {
        self.transport.power_state()
    }

    /// The peripheral of the established session, if any.
    pub fn connected_peripheral(&self) -> Option<PeripheralHandle> {
        self.session
            .as_ref()
            .filter(|s| s.is_established())
            .map(|s| s.peripheral.clone())
    }

    /// Services of the established session, restricted to the UUIDs of the
    /// last service discovery.
    pub fn discovered_services(&self) -> Vec<ServiceDescriptor> {
        match &self.session {
            Some(session) => session
                .services
                .iter()
                .filter(|s| {
                    session.service_filter.is_empty() || session.service_filter.contains(&s.uuid)
                })
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Latest known state of a characteristic of the established session.
    pub fn characteristic(
        &self,
        service_uuid: &Uuid,
        characteristic_uuid: &Uuid,
    ) -> Option<CharacteristicDescriptor> {
        self.session
            .as_ref()?
            .services
            .iter()
            .find(|s| s.uuid == *service_uuid)?
            .characteristic(characteristic_uuid)
            .cloned()
    }

    /// Number of armed deadlines.
    pub fn armed_deadlines(&self) -> usize {
        self.deadlines.armed_count()
    }

    /// The transport adapter.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    // === Commands ===

    /// Start scanning, superseding a scan already in progress.
    pub fn start_scan(&mut self, timeout: Duration, callbacks: ScanCallbacks) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if self.closed {
            session_error!(self.config.log_level, "Cannot scan, session is shut down");
            let on_timeout = callbacks.on_timeout;
            dispatch.push(move || on_timeout(SessionError::Closed));
            return dispatch;
        }

        let state = self.transport.power_state();
        if !state.is_powered_on() {
            session_error!(self.config.log_level, "Cannot scan, radio is {}", state);
            let on_timeout = callbacks.on_timeout;
            dispatch.push(move || on_timeout(SessionError::RadioUnavailable { state }));
            return dispatch;
        }

        if self.session.is_some() || self.connect.is_some() {
            session_error!(
                self.config.log_level,
                "Cannot scan while a peripheral session is active ({})",
                self.phase
            );
            let on_timeout = callbacks.on_timeout;
            dispatch.push(move || on_timeout(SessionError::SessionBusy));
            return dispatch;
        }

        if let Some(previous) = self.scan.take() {
            self.cancel_deadline(previous.deadline);
            session_debug!(self.config.log_level, "Previous scan superseded");
        }

        let deadline = self.deadlines.arm(timeout, SessionEvent::DeadlineElapsed);
        self.scan =
            Some(PendingOperation::new(SessionPhase::Scanning, callbacks).with_deadline(deadline));

        session_debug!(
            self.config.log_level,
            "Starting scan (timeout {:?}, filter {:?})",
            timeout,
            self.config.scan_services
        );
        self.transport.start_scan(&self.config.scan_services);
        self.update_phase();

        dispatch
    }

    /// Stop scanning without invoking any scan callback. Idempotent.
    pub fn stop_scan(&mut self) {
        let Some(op) = self.scan.take() else {
            trace!("Not scanning, ignoring stop request");
            return;
        };

        self.cancel_deadline(op.deadline);
        self.transport.stop_scan();
        session_debug!(self.config.log_level, "Scan stopped");
        self.update_phase();
    }

    /// Connect a peripheral.
    ///
    /// A connection attempt still in flight is always superseded. An
    /// established session with a different peripheral is handled per
    /// the configured [`ConnectPolicy`](crate::ConnectPolicy).
    pub fn connect(&mut self, timeout: Duration, callbacks: ConnectCallbacks) -> Dispatch {
        let mut dispatch = Dispatch::new();
        let target = callbacks.peripheral.id.clone();

        if self.closed {
            session_error!(
                self.config.log_level,
                "Cannot connect {}, session is shut down",
                target
            );
            let on_timed_out = callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::Closed));
            return dispatch;
        }

        let state = self.transport.power_state();
        if !state.is_powered_on() {
            session_error!(
                self.config.log_level,
                "Cannot connect {}, radio is {}",
                target,
                state
            );
            let on_timed_out = callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::RadioUnavailable { state }));
            return dispatch;
        }

        if let Some(scan) = self.scan.take() {
            self.cancel_deadline(scan.deadline);
            self.transport.stop_scan();
            session_debug!(self.config.log_level, "Scan stopped by connect");
        }

        if let Some(previous) = self.connect.take() {
            self.cancel_deadline(previous.deadline);
            if previous.callbacks.peripheral.id != target {
                self.transport.cancel_connect(&previous.callbacks.peripheral.id);
            }
            session_debug!(
                self.config.log_level,
                "Connect to {} superseded",
                previous.callbacks.peripheral.id
            );
        }

        if let Some(session) = self.session.as_mut() {
            if !session.is_established() {
                // The application already gave this session up.
                self.unconfirmed.insert(session.peripheral.id.clone());
                dispatch.extend(self.teardown(DisconnectReason::Requested));
            } else if session.is_for(&target) {
                session_debug!(self.config.log_level, "Already connected to {}", target);
                session.peripheral = callbacks.peripheral.clone();
                session.on_disconnect = Some(callbacks.on_disconnect);
                let on_connect = callbacks.on_connect;
                let peripheral = callbacks.peripheral;
                dispatch.push(move || on_connect(peripheral));
                self.update_phase();
                return dispatch;
            } else {
                match self.config.connect_policy {
                    ConnectPolicy::Reject => {
                        session_error!(
                            self.config.log_level,
                            "Rejecting connect to {}, session with {} is active",
                            target,
                            session.peripheral.id
                        );
                        let on_timed_out = callbacks.on_timed_out;
                        dispatch.push(move || on_timed_out(SessionError::SessionBusy));
                        self.update_phase();
                        return dispatch;
                    }
                    ConnectPolicy::Supersede => {
                        let previous = session.peripheral.id.clone();
                        session_debug!(
                            self.config.log_level,
                            "Session with {} superseded by connect to {}",
                            previous,
                            target
                        );
                        self.transport.disconnect(&previous);
                        self.unconfirmed.insert(previous);
                        dispatch.extend(self.teardown(DisconnectReason::Superseded));
                    }
                }
            }
        }

        let deadline = self.deadlines.arm(timeout, SessionEvent::DeadlineElapsed);
        self.connect = Some(
            PendingOperation::new(SessionPhase::Connecting, callbacks).with_deadline(deadline),
        );

        session_debug!(
            self.config.log_level,
            "Connecting to {} (timeout {:?})",
            target,
            timeout
        );
        self.transport.connect(&target);
        self.update_phase();

        dispatch
    }

    /// Disconnect a peripheral. Idempotent.
    ///
    /// Pending discovery callbacks are discarded before this returns.
    /// `on_disconnect` runs once the adapter confirms, or when the
    /// configured disconnect timeout elapses.
    pub fn disconnect(&mut self, peripheral: &PeripheralId) -> Dispatch {
        let dispatch = Dispatch::new();

        if let Some(op) = take_if(&mut self.connect, |op| op.callbacks.peripheral.id == *peripheral)
        {
            self.cancel_deadline(op.deadline);
            self.transport.cancel_connect(peripheral);
            session_debug!(
                self.config.log_level,
                "Connection attempt to {} abandoned",
                peripheral
            );
            self.update_phase();
            return dispatch;
        }

        let established = self
            .session
            .as_ref()
            .map_or(false, |s| s.is_for(peripheral) && s.is_established());
        if !established {
            trace!("Not connected to {}, ignoring disconnect", peripheral);
            return dispatch;
        }

        self.cancel_discovery();
        let deadline = self
            .deadlines
            .arm(self.config.disconnect_timeout, SessionEvent::DeadlineElapsed);
        if let Some(session) = self.session.as_mut() {
            session.disconnecting = Some(deadline);
        }

        session_debug!(self.config.log_level, "Disconnecting from {}", peripheral);
        self.transport.disconnect(peripheral);
        self.update_phase();

        dispatch
    }

    /// Discover services on the connected peripheral, superseding a
    /// discovery already in flight.
    pub fn discover_services(
        &mut self,
        peripheral: &PeripheralId,
        callbacks: ServiceCallbacks,
    ) -> Dispatch {
        let dispatch = Dispatch::new();

        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.is_for(peripheral) && s.is_established())
        else {
            session_error!(
                self.config.log_level,
                "Cannot discover services, not connected to {}",
                peripheral
            );
            return dispatch;
        };
        session.service_filter = callbacks.uuids.clone();

        if self.services.take().is_some() {
            session_debug!(self.config.log_level, "Previous service discovery superseded");
        }

        let request = self.next_request_id();
        self.transport
            .discover_services(request, peripheral, &callbacks.uuids);
        session_debug!(
            self.config.log_level,
            "Discovering services {:?} on {} ({})",
            callbacks.uuids,
            peripheral,
            request
        );
        self.services = Some(
            PendingOperation::new(SessionPhase::DiscoveringServices, callbacks)
                .with_request(request),
        );
        self.update_phase();

        dispatch
    }

    /// Discover the characteristics of a service and subscribe to the
    /// notifying ones, superseding a discovery already in flight.
    ///
    /// If the deadline elapses no callback runs and earlier discovery
    /// results stay intact; the caller may retry.
    pub fn get_characteristics(
        &mut self,
        timeout: Duration,
        callbacks: CharacteristicCallbacks,
    ) -> Dispatch {
        let dispatch = Dispatch::new();
        let peripheral = callbacks.service.peripheral.clone();

        let established = self
            .session
            .as_ref()
            .map_or(false, |s| s.is_for(&peripheral) && s.is_established());
        if !established {
            session_error!(
                self.config.log_level,
                "Cannot discover characteristics of {}, not connected to {}",
                callbacks.service.uuid,
                peripheral
            );
            return dispatch;
        }

        if let Some(previous) = self.characteristics.take() {
            self.cancel_deadline(previous.deadline);
            session_debug!(
                self.config.log_level,
                "Previous characteristic discovery superseded"
            );
        }

        let request = self.next_request_id();
        let deadline = self.deadlines.arm(timeout, SessionEvent::DeadlineElapsed);
        self.transport
            .discover_characteristics(request, &callbacks.service, &callbacks.uuids);
        session_debug!(
            self.config.log_level,
            "Discovering characteristics {:?} of {} ({}, timeout {:?})",
            callbacks.uuids,
            callbacks.service.uuid,
            request,
            timeout
        );
        self.characteristics = Some(
            PendingOperation::new(SessionPhase::DiscoveringCharacteristics, callbacks)
                .with_deadline(deadline)
                .with_request(request),
        );
        self.update_phase();

        dispatch
    }

    /// Stop everything: scan, connection attempt and session.
    ///
    /// An established session ends immediately with `Requested`. Later
    /// scans and connects fail at once with [`SessionError::Closed`].
    pub fn shutdown(&mut self) -> Dispatch {
        let mut dispatch = Dispatch::new();

        self.stop_scan();

        if let Some(op) = self.connect.take() {
            self.cancel_deadline(op.deadline);
            self.transport.cancel_connect(&op.callbacks.peripheral.id);
        }

        if let Some(session) = &self.session {
            if session.is_established() {
                self.transport.disconnect(&session.peripheral.id);
            }
            dispatch.extend(self.teardown(DisconnectReason::Requested));
        }

        self.deadlines.cancel_all();
        self.closed = true;
        self.update_phase();
        dispatch
    }

    // === Events ===

    /// Consume one event from the session queue.
    pub fn handle_event(&mut self, event: SessionEvent) -> Dispatch {
        match event {
            SessionEvent::DeadlineElapsed(deadline) => self.on_deadline(deadline),
            SessionEvent::Adapter(event) => self.on_adapter_event(event),
        }
    }

    fn on_adapter_event(&mut self, event: AdapterEvent) -> Dispatch {
        match event {
            AdapterEvent::RadioStateChanged(state) => self.on_radio_state(state),
            AdapterEvent::PeripheralDiscovered(peripheral) => {
                self.on_peripheral_discovered(peripheral)
            }
            AdapterEvent::ScanFailed { reason } => self.on_scan_failed(reason),
            AdapterEvent::Connected { peripheral } => self.on_connected(peripheral),
            AdapterEvent::ConnectFailed { peripheral, reason } => {
                self.on_connect_failed(&peripheral, reason)
            }
            AdapterEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(&peripheral, error)
            }
            AdapterEvent::ServicesDiscovered {
                request,
                peripheral,
                result,
            } => self.on_services_discovered(request, &peripheral, result),
            AdapterEvent::CharacteristicsDiscovered {
                request,
                peripheral,
                service_uuid,
                result,
            } => self.on_characteristics_discovered(request, &peripheral, service_uuid, result),
            AdapterEvent::ValueChanged {
                peripheral,
                service_uuid,
                characteristic_uuid,
                value,
            } => self.on_value_changed(&peripheral, service_uuid, characteristic_uuid, value),
            AdapterEvent::PeripheralFault { peripheral, reason } => {
                self.on_peripheral_fault(&peripheral, reason)
            }
        }
    }

    fn on_deadline(&mut self, deadline: DeadlineId) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if !self.deadlines.claim(deadline) {
            trace!("Ignoring stale {}", deadline);
            return dispatch;
        }

        if let Some(op) = take_if(&mut self.scan, |op| op.owns_deadline(deadline)) {
            self.transport.stop_scan();
            session_debug!(self.config.log_level, "Scan timed out");
            let on_timeout = op.callbacks.on_timeout;
            dispatch.push(move || on_timeout(SessionError::TimedOut));
        } else if let Some(op) = take_if(&mut self.connect, |op| op.owns_deadline(deadline)) {
            let peripheral = op.callbacks.peripheral.id;
            self.transport.cancel_connect(&peripheral);
            session_debug!(
                self.config.log_level,
                "Connection to {} timed out",
                peripheral
            );
            let on_timed_out = op.callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::TimedOut));
        } else if let Some(op) =
            take_if(&mut self.characteristics, |op| op.owns_deadline(deadline))
        {
            session_debug!(
                self.config.log_level,
                "Characteristic discovery of {} timed out",
                op.callbacks.service.uuid
            );
        } else if self
            .session
            .as_ref()
            .map_or(false, |s| s.disconnecting == Some(deadline))
        {
            session_debug!(
                self.config.log_level,
                "Disconnect not confirmed by adapter, closing session"
            );
            dispatch.extend(self.teardown(DisconnectReason::Requested));
        }

        self.update_phase();
        dispatch
    }

    fn on_radio_state(&mut self, state: RadioState) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if state.is_powered_on() {
            session_debug!(self.config.log_level, "Radio is powered on");
            return dispatch;
        }

        session_error!(self.config.log_level, "Radio became {}", state);

        if let Some(op) = self.scan.take() {
            self.cancel_deadline(op.deadline);
            let on_timeout = op.callbacks.on_timeout;
            dispatch.push(move || on_timeout(SessionError::RadioUnavailable { state }));
        }

        if let Some(op) = self.connect.take() {
            self.cancel_deadline(op.deadline);
            let on_timed_out = op.callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::RadioUnavailable { state }));
        }

        if self.session.is_some() {
            dispatch.extend(self.teardown(DisconnectReason::RadioUnavailable { state }));
        }

        self.update_phase();
        dispatch
    }

    fn on_peripheral_discovered(&mut self, peripheral: PeripheralHandle) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if self.scan.is_none() {
            trace!("Not scanning, ignoring advertisement from {}", peripheral.id);
            return dispatch;
        }

        if !peripheral
            .advertisement
            .advertises_any(&self.config.scan_services)
        {
            trace!("{} does not advertise a wanted service", peripheral.id);
            return dispatch;
        }

        if let Some(op) = self.scan.take() {
            self.cancel_deadline(op.deadline);
            self.transport.stop_scan();
            session_debug!(
                self.config.log_level,
                "Found peripheral {} ({:?}, RSSI {:?})",
                peripheral.id,
                peripheral.local_name(),
                peripheral.rssi
            );
            let on_found = op.callbacks.on_found;
            dispatch.push(move || on_found(peripheral));
        }

        self.update_phase();
        dispatch
    }

    fn on_scan_failed(&mut self, reason: String) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if let Some(op) = self.scan.take() {
            self.cancel_deadline(op.deadline);
            session_error!(self.config.log_level, "Scan failed: {}", reason);
            let on_timeout = op.callbacks.on_timeout;
            dispatch.push(move || on_timeout(SessionError::Adapter { reason }));
        }

        self.update_phase();
        dispatch
    }

    fn on_connected(&mut self, peripheral: PeripheralId) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if let Some(op) = take_if(&mut self.connect, |op| op.callbacks.peripheral.id == peripheral)
        {
            self.cancel_deadline(op.deadline);
            let ConnectCallbacks {
                peripheral: handle,
                on_connect,
                on_disconnect,
                ..
            } = op.callbacks;

            session_debug!(self.config.log_level, "Connected to {}", peripheral);
            self.session = Some(ActiveSession::new(handle.clone(), on_disconnect));
            dispatch.push(move || on_connect(handle));
        } else if self.session.as_ref().map_or(false, |s| s.is_for(&peripheral)) {
            trace!("Duplicate connection event for {}", peripheral);
        } else {
            session_debug!(
                self.config.log_level,
                "Unexpected connection to {}, disconnecting",
                peripheral
            );
            self.transport.disconnect(&peripheral);
        }

        self.update_phase();
        dispatch
    }

    fn on_connect_failed(&mut self, peripheral: &PeripheralId, reason: String) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if let Some(op) = take_if(&mut self.connect, |op| op.callbacks.peripheral.id == *peripheral)
        {
            self.cancel_deadline(op.deadline);
            session_error!(
                self.config.log_level,
                "Connection to {} failed: {}",
                peripheral,
                reason
            );
            let on_timed_out = op.callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::Adapter { reason }));
        } else {
            trace!("Ignoring connect failure for {}", peripheral);
        }

        self.update_phase();
        dispatch
    }

    fn on_disconnected(&mut self, peripheral: &PeripheralId, error: Option<String>) -> Dispatch {
        let mut dispatch = Dispatch::new();

        if self.unconfirmed.remove(peripheral) {
            trace!("Late disconnect confirmation for {}", peripheral);
            return dispatch;
        }

        if let Some(session) = self.session.as_ref().filter(|s| s.is_for(peripheral)) {
            let reason = if session.disconnecting.is_some() {
                DisconnectReason::Requested
            } else if let Some(reason) = error {
                session_error!(
                    self.config.log_level,
                    "Lost connection to {}: {}",
                    peripheral,
                    reason
                );
                DisconnectReason::AdapterFailure { reason }
            } else {
                DisconnectReason::Remote
            };
            session_debug!(
                self.config.log_level,
                "Disconnected from {} ({})",
                peripheral,
                reason
            );
            dispatch.extend(self.teardown(reason));
        } else if let Some(op) =
            take_if(&mut self.connect, |op| op.callbacks.peripheral.id == *peripheral)
        {
            self.cancel_deadline(op.deadline);
            let reason = error.unwrap_or_else(|| "disconnected while connecting".to_string());
            session_error!(
                self.config.log_level,
                "Connection to {} failed: {}",
                peripheral,
                reason
            );
            let on_timed_out = op.callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::Adapter { reason }));
        } else {
            trace!("Ignoring disconnection of {}", peripheral);
        }

        self.update_phase();
        dispatch
    }

    fn on_services_discovered(
        &mut self,
        request: RequestId,
        peripheral: &PeripheralId,
        result: std::result::Result<Vec<ServiceDescriptor>, String>,
    ) -> Dispatch {
        let mut dispatch = Dispatch::new();

        let Some(op) = take_if(&mut self.services, |op| op.answers(request)) else {
            trace!("Ignoring service discovery result {}", request);
            return dispatch;
        };

        match result {
            Ok(discovered) => {
                if let Some(session) = self.session.as_mut().filter(|s| s.is_for(peripheral)) {
                    for service in discovered {
                        let known = session
                            .services
                            .iter()
                            .find(|s| s.uuid == service.uuid)
                            .map(|s| s.characteristics.clone());
                        let mut service = service;
                        if service.characteristics.is_empty() {
                            if let Some(characteristics) = known {
                                service.characteristics = characteristics;
                            }
                        }
                        session.upsert_service(service);
                    }

                    session_debug!(
                        self.config.log_level,
                        "Discovered {} services on {}",
                        session.services.len(),
                        peripheral
                    );
                    let handle = session.peripheral.clone();
                    let on_found = op.callbacks.on_found;
                    dispatch.push(move || on_found(handle));
                }
            }
            Err(reason) => {
                session_error!(
                    self.config.log_level,
                    "Service discovery on {} failed: {}",
                    peripheral,
                    reason
                );
                dispatch.extend(self.collapse(peripheral, reason));
            }
        }

        self.update_phase();
        dispatch
    }

    fn on_characteristics_discovered(
        &mut self,
        request: RequestId,
        peripheral: &PeripheralId,
        service_uuid: Uuid,
        result: std::result::Result<Vec<CharacteristicDescriptor>, String>,
    ) -> Dispatch {
        let mut dispatch = Dispatch::new();

        let Some(op) = take_if(&mut self.characteristics, |op| op.answers(request)) else {
            trace!("Ignoring characteristic discovery result {}", request);
            return dispatch;
        };
        self.cancel_deadline(op.deadline);

        let discovered = match result {
            Ok(discovered) => discovered,
            Err(reason) => {
                session_error!(
                    self.config.log_level,
                    "Characteristic discovery of {} failed: {}",
                    service_uuid,
                    reason
                );
                dispatch.extend(self.collapse(peripheral, reason));
                self.update_phase();
                return dispatch;
            }
        };

        let CharacteristicCallbacks {
            mut service,
            uuids,
            on_found,
            on_changed,
        } = op.callbacks;

        let Some(session) = self.session.as_mut().filter(|s| s.is_for(peripheral)) else {
            self.update_phase();
            return dispatch;
        };

        for mut characteristic in discovered {
            if characteristic.service_uuid != service.uuid
                || !(uuids.is_empty() || uuids.contains(&characteristic.uuid))
            {
                continue;
            }

            if characteristic.properties.can_subscribe() {
                self.transport.subscribe(&characteristic);
                characteristic.subscribed = true;
                session
                    .subscriptions
                    .insert((service.uuid, characteristic.uuid), on_changed.clone());
            }

            match service
                .characteristics
                .iter_mut()
                .find(|c| c.uuid == characteristic.uuid)
            {
                Some(existing) => *existing = characteristic,
                None => service.characteristics.push(characteristic),
            }
        }

        session_debug!(
            self.config.log_level,
            "Discovered {} characteristics of {}",
            service.characteristics.len(),
            service.uuid
        );
        session.upsert_service(service.clone());
        dispatch.push(move || on_found(service));

        self.update_phase();
        dispatch
    }

    fn on_value_changed(
        &mut self,
        peripheral: &PeripheralId,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        value: bytes::Bytes,
    ) -> Dispatch {
        let mut dispatch = Dispatch::new();

        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.is_for(peripheral) && s.is_established())
        else {
            trace!("Ignoring value change from {}", peripheral);
            return dispatch;
        };

        let Some(on_changed) = session
            .subscriptions
            .get(&(service_uuid, characteristic_uuid))
            .cloned()
        else {
            trace!("No subscription for {}", characteristic_uuid);
            return dispatch;
        };

        let Some(characteristic) = session
            .services
            .iter_mut()
            .find(|s| s.uuid == service_uuid)
            .and_then(|s| {
                s.characteristics
                    .iter_mut()
                    .find(|c| c.uuid == characteristic_uuid)
            })
        else {
            return dispatch;
        };

        characteristic.value = value;
        trace!(
            "Characteristic {} changed: {:02X?}",
            characteristic_uuid,
            &characteristic.value[..]
        );
        let snapshot = characteristic.clone();
        dispatch.push(move || on_changed(&snapshot));

        dispatch
    }

    fn on_peripheral_fault(&mut self, peripheral: &PeripheralId, reason: String) -> Dispatch {
        let mut dispatch = Dispatch::new();

        session_error!(
            self.config.log_level,
            "Adapter fault on {}: {}",
            peripheral,
            reason
        );

        if self.session.as_ref().map_or(false, |s| s.is_for(peripheral)) {
            dispatch.extend(self.collapse(peripheral, reason));
        } else if let Some(op) =
            take_if(&mut self.connect, |op| op.callbacks.peripheral.id == *peripheral)
        {
            self.cancel_deadline(op.deadline);
            let on_timed_out = op.callbacks.on_timed_out;
            dispatch.push(move || on_timed_out(SessionError::Adapter { reason }));
        }

        self.update_phase();
        dispatch
    }

    // === Internals ===

    /// Collapse an adapter failure on an established session into a disconnect.
    fn collapse(&mut self, peripheral: &PeripheralId, reason: String) -> Dispatch {
        if !self.session.as_ref().map_or(false, |s| s.is_for(peripheral)) {
            return Dispatch::new();
        }
        self.transport.disconnect(peripheral);
        self.teardown(DisconnectReason::AdapterFailure { reason })
    }

    /// End the session: discard its pending operations and run
    /// `on_disconnect` at most once.
    fn teardown(&mut self, reason: DisconnectReason) -> Dispatch {
        let mut dispatch = Dispatch::new();

        self.cancel_discovery();

        if let Some(mut session) = self.session.take() {
            self.cancel_deadline(session.disconnecting);
            if let Some(on_disconnect) = session.on_disconnect.take() {
                dispatch.push(move || on_disconnect(reason));
            }
        }

        self.update_phase();
        dispatch
    }

    /// Discard in-flight discovery operations without running their callbacks.
    fn cancel_discovery(&mut self) {
        if self.services.take().is_some() {
            trace!("Service discovery discarded");
        }
        if let Some(op) = self.characteristics.take() {
            self.cancel_deadline(op.deadline);
            trace!("Characteristic discovery discarded");
        }
    }

    fn cancel_deadline(&mut self, deadline: Option<DeadlineId>) {
        if let Some(deadline) = deadline {
            self.deadlines.cancel(deadline);
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId::new(self.next_request)
    }

    fn update_phase(&mut self) {
        let phase = match &self.session {
            Some(session) if !session.is_established() => SessionPhase::Disconnecting,
            Some(_) if self.services.is_some() => SessionPhase::DiscoveringServices,
            Some(_) if self.characteristics.is_some() => SessionPhase::DiscoveringCharacteristics,
            Some(_) => SessionPhase::Connected,
            None if self.connect.is_some() => SessionPhase::Connecting,
            None if self.scan.is_some() => SessionPhase::Scanning,
            None => SessionPhase::Idle,
        };

        if phase != self.phase {
            session_debug!(
                self.config.log_level,
                "Session phase changed: {} -> {}",
                self.phase,
                phase
            );
            self.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::MockTransportAdapter;
    use crate::ble::types::{AdvertisementData, CharacteristicProperties};
    use crate::ble::uuids::{CHARACTERISTIC_UUID_1, SERVICE_UUID};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn handle(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(
            PeripheralId::new(id),
            AdvertisementData {
                service_uuids: vec![SERVICE_UUID],
                ..Default::default()
            },
            Some(-60),
        )
    }

    fn machine(
        transport: MockTransportAdapter,
    ) -> (
        SessionStateMachine<MockTransportAdapter>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SessionStateMachine::new(transport, SessionConfig::default(), tx),
            rx,
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let record = move |name: &str| -> Box<dyn FnOnce() + Send> {
            let sink = sink.clone();
            let name = name.to_string();
            Box::new(move || sink.lock().push(name))
        };
        (log, record)
    }

    fn scan_callbacks(record: &impl Fn(&str) -> Box<dyn FnOnce() + Send>) -> ScanCallbacks {
        let found = record("found");
        let timeout = record("timeout");
        ScanCallbacks {
            on_found: Box::new(move |_| found()),
            on_timeout: Box::new(move |_| timeout()),
        }
    }

    #[tokio::test]
    async fn test_scan_fails_fast_when_radio_off() {
        let mut transport = MockTransportAdapter::new();
        transport
            .expect_power_state()
            .return_const(RadioState::PoweredOff);
        transport.expect_start_scan().times(0);

        let (mut machine, _rx) = machine(transport);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();

        machine
            .start_scan(
                Duration::from_secs(5),
                ScanCallbacks {
                    on_found: Box::new(|_| panic!("no peripheral expected")),
                    on_timeout: Box::new(move |err| sink.lock().push(err)),
                },
            )
            .run();

        assert_eq!(
            *errors.lock(),
            vec![SessionError::RadioUnavailable {
                state: RadioState::PoweredOff
            }]
        );
        assert_eq!(machine.phase(), SessionPhase::Idle);
        assert_eq!(machine.armed_deadlines(), 0);
    }

    #[tokio::test]
    async fn test_found_peripheral_stops_scan_and_cancels_deadline() {
        let mut transport = MockTransportAdapter::new();
        transport
            .expect_power_state()
            .return_const(RadioState::PoweredOn);
        transport.expect_start_scan().times(1).return_const(());
        transport.expect_stop_scan().times(1).return_const(());

        let (mut machine, _rx) = machine(transport);
        let (log, record) = recorder();

        machine
            .start_scan(Duration::from_secs(5), scan_callbacks(&record))
            .run();
        assert_eq!(machine.phase(), SessionPhase::Scanning);
        assert_eq!(machine.armed_deadlines(), 1);

        machine
            .handle_event(SessionEvent::Adapter(AdapterEvent::PeripheralDiscovered(
                handle("p1"),
            )))
            .run();

        assert_eq!(*log.lock(), vec!["found".to_string()]);
        assert_eq!(machine.phase(), SessionPhase::Idle);
        assert_eq!(machine.armed_deadlines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_deadline_is_ignored() {
        let mut transport = MockTransportAdapter::new();
        transport
            .expect_power_state()
            .return_const(RadioState::PoweredOn);
        transport.expect_start_scan().return_const(());
        transport.expect_stop_scan().return_const(());

        let (mut machine, mut rx) = machine(transport);
        let (log, record) = recorder();

        machine
            .start_scan(Duration::from_millis(10), scan_callbacks(&record))
            .run();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The deadline event is queued, but the success is processed first.
        machine
            .handle_event(SessionEvent::Adapter(AdapterEvent::PeripheralDiscovered(
                handle("p1"),
            )))
            .run();
        let late = rx.try_recv().expect("deadline event queued");
        assert!(machine.handle_event(late).is_empty());

        assert_eq!(*log.lock(), vec!["found".to_string()]);
    }

    #[tokio::test]
    async fn test_late_connection_is_disconnected() {
        let mut transport = MockTransportAdapter::new();
        transport
            .expect_disconnect()
            .withf(|id| id.as_str() == "stray")
            .times(1)
            .return_const(());

        let (mut machine, _rx) = machine(transport);

        let dispatch = machine.handle_event(SessionEvent::Adapter(AdapterEvent::Connected {
            peripheral: PeripheralId::new("stray"),
        }));

        assert!(dispatch.is_empty());
        assert_eq!(machine.phase(), SessionPhase::Idle);
        assert!(machine.connected_peripheral().is_none());
    }

    #[tokio::test]
    async fn test_discover_services_without_session_is_dropped() {
        let mut transport = MockTransportAdapter::new();
        transport.expect_discover_services().times(0);

        let (mut machine, _rx) = machine(transport);
        let dispatch = machine.discover_services(
            &PeripheralId::new("p1"),
            ServiceCallbacks {
                uuids: vec![SERVICE_UUID],
                on_found: Box::new(|_| panic!("not connected")),
            },
        );

        assert!(dispatch.is_empty());
        assert_eq!(machine.phase(), SessionPhase::Idle);
    }

    /// Transport accepting every command, for tests that drive events by hand.
    fn permissive_transport() -> MockTransportAdapter {
        let mut transport = MockTransportAdapter::new();
        transport
            .expect_power_state()
            .return_const(RadioState::PoweredOn);
        transport.expect_connect().return_const(());
        transport.expect_discover_services().return_const(());
        transport.expect_discover_characteristics().return_const(());
        transport.expect_subscribe().return_const(());
        transport
    }

    fn connected_machine() -> (
        SessionStateMachine<MockTransportAdapter>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (mut machine, rx) = machine(permissive_transport());
        machine
            .connect(
                Duration::from_secs(5),
                ConnectCallbacks {
                    peripheral: handle("p1"),
                    on_connect: Box::new(|_| {}),
                    on_disconnect: Box::new(|_| {}),
                    on_timed_out: Box::new(|err| panic!("connect failed: {}", err)),
                },
            )
            .run();
        machine
            .handle_event(SessionEvent::Adapter(AdapterEvent::Connected {
                peripheral: PeripheralId::new("p1"),
            }))
            .run();
        assert_eq!(machine.phase(), SessionPhase::Connected);
        (machine, rx)
    }

    fn services_found(request: u64) -> SessionEvent {
        SessionEvent::Adapter(AdapterEvent::ServicesDiscovered {
            request: RequestId::new(request),
            peripheral: PeripheralId::new("p1"),
            result: Ok(vec![ServiceDescriptor::new(
                SERVICE_UUID,
                PeripheralId::new("p1"),
            )]),
        })
    }

    fn characteristics_found(request: u64) -> SessionEvent {
        let mut characteristic = CharacteristicDescriptor::new(
            CHARACTERISTIC_UUID_1,
            SERVICE_UUID,
            PeripheralId::new("p1"),
            CharacteristicProperties::READ_NOTIFY,
        );
        characteristic.value = bytes::Bytes::from_static(b"01");
        SessionEvent::Adapter(AdapterEvent::CharacteristicsDiscovered {
            request: RequestId::new(request),
            peripheral: PeripheralId::new("p1"),
            service_uuid: SERVICE_UUID,
            result: Ok(vec![characteristic]),
        })
    }

    fn characteristic_callbacks(on_found: Box<dyn FnOnce() + Send>) -> CharacteristicCallbacks {
        CharacteristicCallbacks {
            service: ServiceDescriptor::new(SERVICE_UUID, PeripheralId::new("p1")),
            uuids: vec![CHARACTERISTIC_UUID_1],
            on_found: Box::new(move |_| on_found()),
            on_changed: Arc::new(|_| {}),
        }
    }

    #[tokio::test]
    async fn test_superseded_connect_reports_only_the_second() {
        let (mut machine, _rx) = machine(permissive_transport());
        let (log, record) = recorder();

        for name in ["first", "second"] {
            let connected = record(name);
            let failed = record("timed out");
            machine
                .connect(
                    Duration::from_secs(5),
                    ConnectCallbacks {
                        peripheral: handle("p1"),
                        on_connect: Box::new(move |_| connected()),
                        on_disconnect: Box::new(|_| {}),
                        on_timed_out: Box::new(move |_| failed()),
                    },
                )
                .run();
        }
        assert_eq!(machine.armed_deadlines(), 1);

        machine
            .handle_event(SessionEvent::Adapter(AdapterEvent::Connected {
                peripheral: PeripheralId::new("p1"),
            }))
            .run();

        assert_eq!(*log.lock(), vec!["second".to_string()]);
        assert_eq!(machine.armed_deadlines(), 0);
    }

    #[tokio::test]
    async fn test_superseded_service_discovery_result_is_dropped() {
        let (mut machine, _rx) = connected_machine();
        let (log, record) = recorder();

        for name in ["first", "second"] {
            let found = record(name);
            machine
                .discover_services(
                    &PeripheralId::new("p1"),
                    ServiceCallbacks {
                        uuids: vec![SERVICE_UUID],
                        on_found: Box::new(move |_| found()),
                    },
                )
                .run();
        }

        assert!(machine.handle_event(services_found(1)).is_empty());
        assert_eq!(machine.phase(), SessionPhase::DiscoveringServices);

        machine.handle_event(services_found(2)).run();
        assert_eq!(*log.lock(), vec!["second".to_string()]);
        assert_eq!(machine.phase(), SessionPhase::Connected);
        assert_eq!(machine.discovered_services().len(), 1);
    }

    #[tokio::test]
    async fn test_superseded_characteristic_discovery_result_is_dropped() {
        let (mut machine, _rx) = connected_machine();
        let (log, record) = recorder();

        machine
            .get_characteristics(
                Duration::from_secs(5),
                characteristic_callbacks(record("first")),
            )
            .run();
        machine
            .get_characteristics(
                Duration::from_secs(5),
                characteristic_callbacks(record("second")),
            )
            .run();
        assert_eq!(machine.armed_deadlines(), 1);

        assert!(machine.handle_event(characteristics_found(1)).is_empty());
        assert_eq!(machine.phase(), SessionPhase::DiscoveringCharacteristics);

        machine.handle_event(characteristics_found(2)).run();
        assert_eq!(*log.lock(), vec!["second".to_string()]);
        assert_eq!(machine.armed_deadlines(), 0);
        assert_eq!(machine.phase(), SessionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_characteristic_result_after_timeout_is_dropped() {
        let (mut machine, mut rx) = connected_machine();
        let (log, record) = recorder();

        machine
            .get_characteristics(
                Duration::from_millis(10),
                characteristic_callbacks(record("found")),
            )
            .run();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let elapsed = rx.try_recv().expect("deadline event queued");
        assert!(machine.handle_event(elapsed).is_empty());
        assert_eq!(machine.phase(), SessionPhase::Connected);

        assert!(machine.handle_event(characteristics_found(1)).is_empty());
        assert!(log.lock().is_empty());
        assert!(machine
            .characteristic(&SERVICE_UUID, &CHARACTERISTIC_UUID_1)
            .is_none());
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail_fast() {
        let (mut machine, _rx) = machine(permissive_transport());
        machine.shutdown().run();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let scan_errors = errors.clone();
        let connect_errors = errors.clone();
        machine
            .start_scan(
                Duration::from_secs(5),
                ScanCallbacks {
                    on_found: Box::new(|_| panic!("no peripheral expected")),
                    on_timeout: Box::new(move |err| scan_errors.lock().push(err)),
                },
            )
            .run();
        machine
            .connect(
                Duration::from_secs(5),
                ConnectCallbacks {
                    peripheral: handle("p1"),
                    on_connect: Box::new(|_| panic!("no connection expected")),
                    on_disconnect: Box::new(|_| {}),
                    on_timed_out: Box::new(move |err| connect_errors.lock().push(err)),
                },
            )
            .run();

        assert_eq!(
            *errors.lock(),
            vec![SessionError::Closed, SessionError::Closed]
        );
        assert_eq!(machine.armed_deadlines(), 0);
    }
}
