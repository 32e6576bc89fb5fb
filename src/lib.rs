// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]

//! # blue-mambo
//!
//! A Bluetooth Low Energy central-role session manager.
//!
//! A session walks a single peripheral through scan, connect, service
//! discovery and characteristic discovery, then delivers value changes of
//! the subscribed characteristics. Every phase is bounded by a deadline,
//! and every command reports its outcome through callbacks.
//!
//! ## Features
//!
//! - **Deadline-bounded phases**: each scan, connect and characteristic
//!   discovery ends in exactly one success or timeout callback
//! - **Supersede semantics**: re-issuing a command discards the earlier
//!   command's callbacks
//! - **Radio tracking**: commands fail fast while the radio is off, and a
//!   radio going down ends the session
//! - **Host radio** through `btleplug`, or an in-memory **loopback radio**
//!   with a peripheral role for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blue_mambo::{SessionConfig, SessionManager, Result, SERVICE_UUID};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SessionConfig::new().with_scan_services([SERVICE_UUID]);
//!     let manager = SessionManager::bluetooth(config).await?;
//!
//!     manager.start_scan(
//!         Duration::from_secs(5),
//!         |peripheral| println!("Found {:?}", peripheral.local_name()),
//!         |err| println!("Nothing found: {}", err),
//!     );
//!
//!     tokio::time::sleep(Duration::from_secs(6)).await;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for descriptor types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod session;
pub mod session_manager;

mod logging;

// Re-exports for convenience
pub use config::{ConnectPolicy, LogLevel, SessionConfig};
pub use error::{DisconnectReason, Error, Result, SessionError};
pub use session::SessionPhase;
pub use session_manager::SessionManager;

// Re-export commonly used types from submodules
pub use ble::{
    Advertiser, BtleplugTransport, CharacteristicDescriptor, CharacteristicProperties,
    EventQueue, LoopbackRadio, PeripheralHandle, PeripheralId, RadioState, ServiceDescriptor,
    TransportAdapter, CHARACTERISTIC_UUIDS, CHARACTERISTIC_UUID_1, CHARACTERISTIC_UUID_2,
    SERVICE_NAME, SERVICE_UUID,
};
