//! Transport seam between the bridge and the broker
//!
//! The bridge only needs a few things from a broker: open a connection,
//! subscribe to a subject, publish to a subject, and take one message off
//! the persistent request work queue. Keeping them behind traits
//! lets the same call path run over async-nats, the in-process
//! [`MemoryBroker`](super::memory::MemoryBroker), or a pooled connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::types::Result;

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for the duration of one call
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// An open broker connection
///
/// Implementations release the connection on drop if `close` was never
/// awaited, so an aborted call still gives the connection back.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Subscribe to a subject
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>>;

    /// Publish a payload to a subject
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Take the oldest queued request matching `filter`, acknowledging it
    ///
    /// Waits up to `expires` for one to arrive. `None` when nothing did.
    async fn next_queued(&self, filter: &str, expires: Duration) -> Result<Option<Bytes>>;

    /// Close the connection. Calling it more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A live subscription on one subject
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery. `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Result<Bytes>>;

    /// Tear down the subscription. Calling it more than once is a no-op.
    async fn unsubscribe(&mut self) -> Result<()>;
}
