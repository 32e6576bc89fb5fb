//! Pending operations and the callback records they carry.
//!
//! Callbacks are held in explicit records so that superseding an
//! operation is a visible action: the record is dropped and none of its
//! callbacks run.

use std::sync::Arc;
use uuid::Uuid;

use crate::ble::transport::RequestId;
use crate::ble::types::{CharacteristicDescriptor, PeripheralHandle, ServiceDescriptor};
use crate::error::{DisconnectReason, SessionError};
use crate::session::phase::SessionPhase;
use crate::session::timer::DeadlineId;

/// Invoked with the peripheral a scan found.
pub type FoundPeripheralFn = Box<dyn FnOnce(PeripheralHandle) + Send>;
/// Invoked when a command fails or its deadline elapses.
pub type FailureFn = Box<dyn FnOnce(SessionError) + Send>;
/// Invoked when a connection is established.
pub type ConnectFn = Box<dyn FnOnce(PeripheralHandle) + Send>;
/// Invoked once when an established connection ends.
pub type DisconnectFn = Box<dyn FnOnce(DisconnectReason) + Send>;
/// Invoked when service discovery completes.
pub type FoundServicesFn = Box<dyn FnOnce(PeripheralHandle) + Send>;
/// Invoked when characteristic discovery completes.
pub type FoundCharacteristicsFn = Box<dyn FnOnce(ServiceDescriptor) + Send>;
/// Invoked on every value change of a subscribed characteristic.
pub type ChangedCharacteristicFn = Arc<dyn Fn(&CharacteristicDescriptor) + Send + Sync>;

/// Callbacks of a scan.
pub struct ScanCallbacks {
    /// A matching peripheral was found.
    pub on_found: FoundPeripheralFn,
    /// Nothing was found in time, or the scan could not start.
    pub on_timeout: FailureFn,
}

/// Callbacks of a connect, plus the peripheral being connected.
pub struct ConnectCallbacks {
    /// The peripheral to connect.
    pub peripheral: PeripheralHandle,
    /// The link is up.
    pub on_connect: ConnectFn,
    /// Retained for the lifetime of the connection.
    pub on_disconnect: DisconnectFn,
    /// The link did not come up in time or could not be made.
    pub on_timed_out: FailureFn,
}

/// Callbacks of a service discovery.
pub struct ServiceCallbacks {
    /// Services of interest. Empty means all.
    pub uuids: Vec<Uuid>,
    /// Discovery completed.
    pub on_found: FoundServicesFn,
}

/// Callbacks of a characteristic discovery.
pub struct CharacteristicCallbacks {
    /// The service to inspect.
    pub service: ServiceDescriptor,
    /// Characteristics of interest. Empty means all.
    pub uuids: Vec<Uuid>,
    /// Discovery completed.
    pub on_found: FoundCharacteristicsFn,
    /// Standing subscription, valid until disconnect.
    pub on_changed: ChangedCharacteristicFn,
}

/// An operation waiting for an adapter event or its deadline.
pub struct PendingOperation<C> {
    /// Phase this operation drives.
    pub phase: SessionPhase,
    /// Deadline bounding the operation, if any.
    pub deadline: Option<DeadlineId>,
    /// Request identity echoed by the adapter, for discovery operations.
    pub request: Option<RequestId>,
    /// Callbacks to run on completion.
    pub callbacks: C,
}

impl<C> PendingOperation<C> {
    /// Create a pending operation.
    pub fn new(phase: SessionPhase, callbacks: C) -> Self {
        Self {
            phase,
            deadline: None,
            request: None,
            callbacks,
        }
    }

    /// Attach a deadline.
    pub fn with_deadline(mut self, deadline: DeadlineId) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a request identity.
    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    /// Check if this operation is bounded by `deadline`.
    pub fn owns_deadline(&self, deadline: DeadlineId) -> bool {
        self.deadline == Some(deadline)
    }

    /// Check if this operation is answered by `request`.
    pub fn answers(&self, request: RequestId) -> bool {
        self.request == Some(request)
    }
}

/// User callbacks collected under the session lock, run after it is released.
#[derive(Default)]
#[must_use = "collected callbacks do nothing unless run"]
pub struct Dispatch {
    calls: Vec<Box<dyn FnOnce() + Send>>,
}

impl Dispatch {
    /// Create an empty dispatch list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a callback.
    pub fn push(&mut self, call: impl FnOnce() + Send + 'static) {
        self.calls.push(Box::new(call));
    }

    /// Append another dispatch list.
    pub fn extend(&mut self, other: Dispatch) {
        self.calls.extend(other.calls);
    }

    /// Number of queued callbacks.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Run every queued callback in order.
    pub fn run(self) {
        for call in self.calls {
            call();
        }
    }
}
