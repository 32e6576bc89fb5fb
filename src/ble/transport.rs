//! Transport adapter interface.
//!
//! A [`TransportAdapter`] wraps a BLE radio stack. Commands are
//! fire-and-forget: they return immediately and their outcome arrives
//! later as an [`AdapterEvent`] posted through the [`EventSink`] the
//! adapter was built with. The session core is the only consumer of
//! those events.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::types::{
    CharacteristicDescriptor, PeripheralHandle, PeripheralId, RadioState, ServiceDescriptor,
};
use crate::session::SessionEvent;

/// Identity of a discovery request, echoed back in the matching result event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Create a request identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events a transport adapter reports to the session core.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// The radio changed power/authorization state.
    RadioStateChanged(RadioState),
    /// A scan saw an advertisement.
    PeripheralDiscovered(PeripheralHandle),
    /// The radio could not start scanning.
    ScanFailed {
        /// Description of the failure.
        reason: String,
    },
    /// A connection attempt succeeded.
    Connected {
        /// The connected peripheral.
        peripheral: PeripheralId,
    },
    /// A connection attempt failed.
    ConnectFailed {
        /// The peripheral that could not be connected.
        peripheral: PeripheralId,
        /// Description of the failure.
        reason: String,
    },
    /// The link to a peripheral went down.
    Disconnected {
        /// The peripheral that disconnected.
        peripheral: PeripheralId,
        /// Error reported with the disconnection, if any.
        error: Option<String>,
    },
    /// Result of [`TransportAdapter::discover_services`].
    ServicesDiscovered {
        /// The request this answers.
        request: RequestId,
        /// The peripheral that was queried.
        peripheral: PeripheralId,
        /// Discovered services or a failure description.
        result: std::result::Result<Vec<ServiceDescriptor>, String>,
    },
    /// Result of [`TransportAdapter::discover_characteristics`].
    CharacteristicsDiscovered {
        /// The request this answers.
        request: RequestId,
        /// The peripheral that was queried.
        peripheral: PeripheralId,
        /// The service that was queried.
        service_uuid: Uuid,
        /// Discovered characteristics or a failure description.
        result: std::result::Result<Vec<CharacteristicDescriptor>, String>,
    },
    /// A subscribed characteristic changed value.
    ValueChanged {
        /// The peripheral that sent the update.
        peripheral: PeripheralId,
        /// The service owning the characteristic.
        service_uuid: Uuid,
        /// The characteristic that changed.
        characteristic_uuid: Uuid,
        /// The new value.
        value: Bytes,
    },
    /// The radio stack failed on an established connection.
    PeripheralFault {
        /// The affected peripheral.
        peripheral: PeripheralId,
        /// Description of the failure.
        reason: String,
    },
}

/// Command surface of a BLE radio stack in the central role.
///
/// Implementations must not block: every command either completes
/// synchronously and posts its result event, or hands the work to a
/// background task that posts it later.
#[cfg_attr(test, mockall::automock)]
pub trait TransportAdapter: Send {
    /// Current radio state.
    fn power_state(&self) -> RadioState;

    /// Begin reporting advertisements. An empty filter reports everything.
    fn start_scan(&self, service_uuids: &[Uuid]);

    /// Stop reporting advertisements.
    fn stop_scan(&self);

    /// Begin connecting to a peripheral.
    fn connect(&self, peripheral: &PeripheralId);

    /// Abandon a connection attempt that has not completed.
    fn cancel_connect(&self, peripheral: &PeripheralId);

    /// Tear down a connection.
    fn disconnect(&self, peripheral: &PeripheralId);

    /// Discover services, restricted to `uuids` when the stack supports it.
    fn discover_services(&self, request: RequestId, peripheral: &PeripheralId, uuids: &[Uuid]);

    /// Discover the characteristics of a service.
    fn discover_characteristics(
        &self,
        request: RequestId,
        service: &ServiceDescriptor,
        uuids: &[Uuid],
    );

    /// Start delivering value changes of a characteristic.
    fn subscribe(&self, characteristic: &CharacteristicDescriptor);
}

/// Handle through which a transport adapter posts events to the session queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Post an event. Returns false once the session has shut down.
    pub fn deliver(&self, event: AdapterEvent) -> bool {
        match self.tx.send(SessionEvent::Adapter(event)) {
            Ok(()) => true,
            Err(_) => {
                trace!("Session queue closed, dropping adapter event");
                false
            }
        }
    }

    /// Check if the session is still consuming events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single event queue of a session: adapter events and deadline expiries.
#[derive(Debug)]
pub struct EventQueue {
    pub(crate) tx: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A sink for a transport adapter to post into this queue.
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_delivers_into_queue() {
        let mut queue = EventQueue::new();
        let sink = queue.sink();

        assert!(sink.deliver(AdapterEvent::RadioStateChanged(RadioState::PoweredOn)));

        match queue.rx.try_recv() {
            Ok(SessionEvent::Adapter(AdapterEvent::RadioStateChanged(state))) => {
                assert_eq!(state, RadioState::PoweredOn);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_sink_reports_closed_queue() {
        let queue = EventQueue::new();
        let sink = queue.sink();
        drop(queue);

        assert!(sink.is_closed());
        assert!(!sink.deliver(AdapterEvent::ScanFailed {
            reason: "off".to_string(),
        }));
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::new(7).to_string(), "#7");
        assert_eq!(RequestId::new(7).as_u64(), 7);
    }
}
