//! In-process broker
//!
//! A small subject-matching pub/sub hub that implements the transport traits
//! without a network. Selected with `--broker memory` for dry runs without
//! nats-server, and used as the fake broker in tests: it counts connects,
//! closes and unsubscribes, keeps a log of everything published, and can be
//! told to refuse connections, fail subscribes or publishes, or push delivery
//! errors at subscribers.
//!
//! The request work queue behaves like the JetStream work-queue stream the
//! NATS client uses: once a connection has asked for queued requests, later
//! publishes to any `autopilot.request.*` subject are held until one receiver
//! whose filter matches takes them.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::messages::all_requests_subject;
use super::transport::{Connection, Connector, Subscription};
use crate::types::{BridgeError, Result};

type Delivery = Result<Bytes>;

/// A message recorded by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub subject: String,
    pub payload: Bytes,
}

/// Broker operations, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connect,
    Close,
    Subscribe(String),
    Unsubscribe(String),
    Publish(String),
    /// A queued message was taken off a work queue
    Ack(String),
}

struct SubscriberEntry {
    pattern: String,
    /// Connection that owns the subscription, `None` for broker-level taps
    connection: Option<u64>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: DashMap<u64, SubscriberEntry>,
    published: Mutex<Vec<Published>>,
    events: Mutex<Vec<BrokerEvent>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    unsubscribes: AtomicUsize,
    refuse_connections: AtomicBool,
    fail_subscribes: AtomicBool,
    fail_publishes: AtomicBool,
    /// Subjects whose publishes are retained for queue receivers
    queue_subjects: Mutex<Vec<String>>,
    queued: Mutex<VecDeque<Published>>,
    queue_signal: Notify,
}

impl BrokerInner {
    fn record(&self, event: BrokerEvent) {
        lock(&self.events).push(event);
    }
}

/// In-process pub/sub broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe directly on the broker, outside any connection
    pub fn subscribe(&self, pattern: &str) -> MemorySubscription {
        self.register(pattern, None)
    }

    /// Publish directly on the broker. Returns the number of deliveries.
    pub fn publish(&self, subject: &str, payload: Bytes) -> usize {
        lock(&self.inner.published).push(Published {
            subject: subject.to_string(),
            payload: payload.clone(),
        });
        self.record(BrokerEvent::Publish(subject.to_string()));
        self.retain(subject, &payload);

        let mut delivered = 0;
        for entry in self.inner.subscribers.iter() {
            if subject_matches(&entry.pattern, subject) && entry.tx.send(Ok(payload.clone())).is_ok() {
                delivered += 1;
            }
        }
        debug!("Published to {} ({} deliveries)", subject, delivered);
        delivered
    }

    /// Push a delivery error to every subscriber matching `subject`
    pub fn inject_error(&self, subject: &str, message: &str) {
        for entry in self.inner.subscribers.iter() {
            if subject_matches(&entry.pattern, subject) {
                let _ = entry
                    .tx
                    .send(Err(BridgeError::Subscribe(message.to_string())));
            }
        }
    }

    /// Make subsequent `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make subsequent connection-level subscribes fail
    pub fn fail_subscribes(&self, fail: bool) {
        self.inner.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent connection-level publishes fail
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<Published> {
        lock(&self.inner.published).clone()
    }

    /// Messages published to one subject
    pub fn published_to(&self, subject: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.subject == subject)
            .collect()
    }

    /// Operations seen so far, in order
    pub fn events(&self) -> Vec<BrokerEvent> {
        lock(&self.inner.events).clone()
    }

    /// Connections opened so far
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections closed so far
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Subscriptions torn down so far
    pub fn unsubscribes(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    /// Live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Whether any live subscription matches `subject`
    pub fn has_subscriber(&self, subject: &str) -> bool {
        self.inner
            .subscribers
            .iter()
            .any(|entry| subject_matches(&entry.pattern, subject))
    }

    /// Messages held on work queues and not yet taken
    pub fn queued_count(&self) -> usize {
        lock(&self.inner.queued).len()
    }

    fn record(&self, event: BrokerEvent) {
        self.inner.record(event);
    }

    fn retain(&self, subject: &str, payload: &Bytes) {
        let retained = lock(&self.inner.queue_subjects)
            .iter()
            .any(|filter| subject_matches(filter, subject));
        if !retained {
            return;
        }

        lock(&self.inner.queued).push_back(Published {
            subject: subject.to_string(),
            payload: payload.clone(),
        });
        self.inner.queue_signal.notify_waiters();
    }

    fn retain_subjects(&self, pattern: &str) {
        let mut subjects = lock(&self.inner.queue_subjects);
        if !subjects.iter().any(|s| s == pattern) {
            subjects.push(pattern.to_string());
        }
    }

    fn take_queued(&self, filter: &str) -> Option<Published> {
        let mut queued = lock(&self.inner.queued);
        let position = queued
            .iter()
            .position(|p| subject_matches(filter, &p.subject))?;
        let taken = queued.remove(position)?;
        drop(queued);

        self.record(BrokerEvent::Ack(taken.subject.clone()));
        Some(taken)
    }

    fn register(&self, pattern: &str, connection: Option<u64>) -> MemorySubscription {
        self.record(BrokerEvent::Subscribe(pattern.to_string()));
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(
            sid,
            SubscriberEntry {
                pattern: pattern.to_string(),
                connection,
                tx,
            },
        );
        MemorySubscription {
            sid,
            subject: pattern.to_string(),
            rx,
            broker: Arc::clone(&self.inner),
            active: true,
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("connection refused".to_string()));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.record(BrokerEvent::Connect);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        debug!("Memory connection {} opened", id);

        Ok(Box::new(MemoryConnection {
            id,
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection handed out by [`MemoryBroker`]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Closing a connection ends every subscription it owns
        self.broker
            .inner
            .subscribers
            .retain(|_, entry| entry.connection != Some(self.id));
        self.broker.inner.closes.fetch_add(1, Ordering::SeqCst);
        self.broker.record(BrokerEvent::Close);
        debug!("Memory connection {} closed", self.id);
        true
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        if self.broker.inner.fail_subscribes.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscribe(format!("Subscribe to {} failed", subject)));
        }
        Ok(Box::new(self.broker.register(subject, Some(self.id))))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        if self.broker.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish(format!("Publish to {} failed", subject)));
        }
        self.broker.publish(subject, payload);
        Ok(())
    }

    async fn next_queued(&self, filter: &str, expires: Duration) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.broker.retain_subjects(&all_requests_subject());

        let deadline = tokio::time::Instant::now() + expires;
        loop {
            let notified = self.broker.inner.queue_signal.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed
            notified.as_mut().enable();

            if let Some(taken) = self.broker.take_queued(filter) {
                debug!("Took queued message from {}", taken.subject);
                return Ok(Some(taken.payload));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Subscription handed out by [`MemoryBroker`]
pub struct MemorySubscription {
    sid: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    broker: Arc<BrokerInner>,
    active: bool,
}

impl MemorySubscription {
    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.broker.subscribers.remove(&self.sid);
        self.broker.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.broker.record(BrokerEvent::Unsubscribe(self.subject.clone()));
        self.rx.close();
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.remove();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.active {
            self.broker.subscribers.remove(&self.sid);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// NATS subject matching: `*` matches one token, a trailing `>` matches the rest
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
