//! Central-role session core.
//!
//! This module contains the state machine that coordinates scan, connect,
//! service discovery and characteristic discovery, and the deadline timer
//! that bounds each of those phases.

pub mod machine;
pub mod pending;
pub mod phase;
pub mod timer;

pub use machine::SessionStateMachine;
pub use pending::Dispatch;
pub use phase::SessionPhase;
pub use timer::{DeadlineId, DeadlineTimer};

use crate::ble::transport::AdapterEvent;

/// An entry on the session event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Reported by the transport adapter.
    Adapter(AdapterEvent),
    /// A deadline armed by the state machine elapsed.
    DeadlineElapsed(DeadlineId),
}
