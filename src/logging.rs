//! Level-gated logging.
//!
//! Each session manager carries its own [`LogLevel`](crate::LogLevel); these
//! macros check it before handing the message to `tracing`, so two managers
//! in one process can log at different verbosities.

/// Log a diagnostic if the given level allows debug output.
macro_rules! session_debug {
    ($level:expr, $($arg:tt)+) => {
        if $level.debug_enabled() {
            ::tracing::debug!($($arg)+);
        }
    };
}

/// Log a failure if the given level allows error output.
macro_rules! session_error {
    ($level:expr, $($arg:tt)+) => {
        if $level.error_enabled() {
            ::tracing::error!($($arg)+);
        }
    };
}

pub(crate) use session_debug;
pub(crate) use session_error;
