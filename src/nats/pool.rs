//! Shared broker connection with reference-counted leases
//!
//! Wraps any [`Connector`] so that concurrent calls share one long-lived
//! connection instead of dialing the broker per call. Each call still gets
//! its own reply subscription, so the correlation id stays the key that
//! separates their responses.
//!
//! The connection is opened by the first lease and closed when the last
//! lease is released. A failed connect is not cached; the next call dials
//! again.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::transport::{Connection, Connector, Subscription};
use crate::types::Result;

#[derive(Default)]
struct PoolState {
    shared: Option<Arc<dyn Connection>>,
    leases: usize,
}

/// Connector that hands out leases on one shared connection
pub struct PooledConnector {
    inner: Arc<dyn Connector>,
    state: Arc<Mutex<PoolState>>,
    /// Serializes dialing so concurrent first calls open one connection
    dial: tokio::sync::Mutex<()>,
}

impl PooledConnector {
    /// Pool connections opened by `inner`
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(PoolState::default())),
            dial: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of outstanding leases
    pub fn lease_count(&self) -> usize {
        lock(&self.state).leases
    }

    /// Whether a shared connection is currently open
    pub fn is_connected(&self) -> bool {
        lock(&self.state).shared.is_some()
    }

    fn lease(&self, shared: Arc<dyn Connection>) -> Box<dyn Connection> {
        Box::new(PooledConnection {
            shared,
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connector for PooledConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let _dialing = self.dial.lock().await;

        {
            let mut state = lock(&self.state);
            if let Some(shared) = state.shared.clone() {
                state.leases += 1;
                debug!("Reusing pooled connection ({} leases)", state.leases);
                return Ok(self.lease(shared));
            }
        }

        let conn: Arc<dyn Connection> = Arc::from(self.inner.connect().await?);

        let mut state = lock(&self.state);
        state.shared = Some(Arc::clone(&conn));
        state.leases = 1;
        info!("Opened pooled connection");
        Ok(self.lease(conn))
    }
}

/// A lease on the pooled connection
pub struct PooledConnection {
    shared: Arc<dyn Connection>,
    state: Arc<Mutex<PoolState>>,
    released: AtomicBool,
}

impl PooledConnection {
    /// Give the lease back. Returns the connection if this was the last lease.
    fn release(&self) -> Option<Arc<dyn Connection>> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }

        let mut state = lock(&self.state);
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            debug!("Last lease released, closing pooled connection");
            state.shared.take()
        } else {
            None
        }
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>> {
        self.shared.subscribe(subject).await
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.shared.publish(subject, payload).await
    }

    async fn next_queued(&self, filter: &str, expires: Duration) -> Result<Option<Bytes>> {
        self.shared.next_queued(filter, expires).await
    }

    async fn close(&self) -> Result<()> {
        match self.release() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.release() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        warn!("Closing pooled connection failed: {}", e);
                    }
                });
            }
            // Outside a runtime the connection is released when dropped
            Err(_) => drop(conn),
        }
    }
}

fn lock(state: &Mutex<PoolState>) -> std::sync::MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
