//! Session phases.

/// The phase a session is in. Exactly one at a time per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionPhase {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Waiting for a matching advertisement.
    Scanning,
    /// Waiting for a connection to complete.
    Connecting,
    /// Connected, no discovery in flight.
    Connected,
    /// Waiting for a service discovery result.
    DiscoveringServices,
    /// Waiting for a characteristic discovery result.
    DiscoveringCharacteristics,
    /// Waiting for the adapter to confirm a requested disconnect.
    Disconnecting,
}

impl SessionPhase {
    /// Check if a peripheral link is established.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::DiscoveringServices | Self::DiscoveringCharacteristics
        )
    }

    /// Check if a deadline-bound or adapter-bound step is in flight.
    pub fn is_transitioning(&self) -> bool {
        !matches!(self, Self::Idle | Self::Connected)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::DiscoveringCharacteristics => write!(f, "DiscoveringCharacteristics"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_phase() {
        assert!(SessionPhase::Connected.is_connected());
        assert!(SessionPhase::DiscoveringCharacteristics.is_connected());
        assert!(!SessionPhase::Connecting.is_connected());
        assert!(!SessionPhase::Disconnecting.is_connected());

        assert!(SessionPhase::Scanning.is_transitioning());
        assert!(SessionPhase::Disconnecting.is_transitioning());
        assert!(!SessionPhase::Idle.is_transitioning());
        assert!(!SessionPhase::Connected.is_transitioning());
    }

    #[test]
    fn test_session_phase_display() {
        assert_eq!(format!("{}", SessionPhase::Connected), "Connected");
        assert_eq!(SessionPhase::default(), SessionPhase::Idle);
    }
}
