//! Peripheral role.
//!
//! The demo pairs a central with a peripheral that publishes one service
//! with notifying characteristics and pushes new values to subscribers.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::Result;

/// A radio acting as a GATT server.
#[async_trait]
pub trait Advertiser: Send + Sync {
    /// Publish `service` with readable, notifying `characteristics` and
    /// start advertising it. Replaces any previously published service.
    async fn start_advertising(&self, service: Uuid, characteristics: &[Uuid]) -> Result<()>;

    /// Stop advertising. Established connections are kept. Idempotent.
    async fn stop_advertising(&self) -> Result<()>;

    /// Set the value of a characteristic and notify every subscribed
    /// central. Returns the number of centrals notified.
    async fn notify_subscribers(&self, characteristic: Uuid, value: Bytes) -> Result<usize>;
}
