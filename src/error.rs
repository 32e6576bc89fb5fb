//! Error types for the blue-mambo crate.
//!
//! [`Error`] is returned by constructors and by the peripheral-role
//! [`Advertiser`](crate::ble::Advertiser). Session commands never return an
//! error; their failures are handed to the caller's callbacks as a
//! [`SessionError`] or a [`DisconnectReason`].

use thiserror::Error;

use crate::ble::types::RadioState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The radio is present but not powered on.
    #[error("Radio not powered on (state: {state})")]
    NotPoweredOn {
        /// The state the radio reported.
        state: RadioState,
    },

    /// The specified peripheral is not known to the adapter.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// The peripheral role is not advertising a service.
    #[error("Not advertising")]
    NotAdvertising,

    /// Characteristic not part of the advertised service.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure handed to a command's timeout/failure callback.
///
/// Superseded commands are not represented here: their callbacks are
/// dropped without being invoked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The radio is off, unauthorized or unsupported. No deadline was armed.
    #[error("Radio unavailable (state: {state})")]
    RadioUnavailable {
        /// The state the radio reported.
        state: RadioState,
    },

    /// The deadline elapsed before the adapter reported a result.
    #[error("Operation timed out")]
    TimedOut,

    /// Another peripheral session is active and the connect policy rejects
    /// a second one.
    #[error("Another peripheral session is active")]
    SessionBusy,

    /// The radio stack reported a failure for this command.
    #[error("Adapter error: {reason}")]
    Adapter {
        /// Description reported by the adapter.
        reason: String,
    },

    /// The session manager was shut down.
    #[error("Session manager is shut down")]
    Closed,
}

/// Why a connected session ended. Handed to `on_disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application called `disconnect`.
    Requested,
    /// The peripheral dropped the link.
    Remote,
    /// The radio left the powered-on state.
    RadioUnavailable {
        /// The state the radio reported.
        state: RadioState,
    },
    /// The radio stack failed mid-session.
    AdapterFailure {
        /// Description reported by the adapter.
        reason: String,
    },
    /// A `connect` to another peripheral replaced this session.
    Superseded,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnect requested"),
            Self::Remote => write!(f, "peripheral disconnected"),
            Self::RadioUnavailable { state } => write!(f, "radio unavailable ({})", state),
            Self::AdapterFailure { reason } => write!(f, "adapter failure: {}", reason),
            Self::Superseded => write!(f, "superseded by another connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::RadioUnavailable {
            state: RadioState::PoweredOff,
        };
        assert_eq!(err.to_string(), "Radio unavailable (state: PoweredOff)");
        assert_eq!(SessionError::TimedOut.to_string(), "Operation timed out");
        assert_eq!(
            SessionError::Closed.to_string(),
            "Session manager is shut down"
        );
    }

    #[test]
    fn test_disconnect_reason_display() {
        let reason = DisconnectReason::AdapterFailure {
            reason: "link lost".to_string(),
        };
        assert_eq!(reason.to_string(), "adapter failure: link lost");
        assert_eq!(DisconnectReason::Requested.to_string(), "disconnect requested");
    }
}
