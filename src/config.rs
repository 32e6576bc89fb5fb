//! Session configuration.

use std::time::Duration;
use uuid::Uuid;

/// What a session manager logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogLevel {
    /// Nothing.
    Off,
    /// Failures only.
    #[default]
    Error,
    /// Failures, phase transitions and adapter traffic.
    Debug,
}

impl LogLevel {
    /// Check if failures are logged.
    pub fn error_enabled(&self) -> bool {
        *self >= Self::Error
    }

    /// Check if diagnostics are logged.
    pub fn debug_enabled(&self) -> bool {
        *self >= Self::Debug
    }
}

/// What `connect` does when a session with another peripheral is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectPolicy {
    /// Fail the new connect with `SessionBusy`; the established session stays.
    #[default]
    Reject,
    /// Tear down the established session (`DisconnectReason::Superseded`)
    /// and connect the new peripheral.
    Supersede,
}

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Log verbosity of this manager.
    pub log_level: LogLevel,
    /// Second-connect policy.
    pub connect_policy: ConnectPolicy,
    /// Services a scan looks for. Empty reports every peripheral.
    pub scan_services: Vec<Uuid>,
    /// How long a requested disconnect waits for adapter confirmation.
    pub disconnect_timeout: Duration,
}

impl SessionConfig {
    /// Default wait for disconnect confirmation (5 seconds).
    pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log verbosity.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Set the second-connect policy.
    pub fn with_connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.connect_policy = policy;
        self
    }

    /// Restrict scans to peripherals advertising any of `services`.
    pub fn with_scan_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.scan_services = services.into_iter().collect();
        self
    }

    /// Set the disconnect confirmation timeout.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            connect_policy: ConnectPolicy::default(),
            scan_services: Vec::new(),
            disconnect_timeout: Self::DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}
