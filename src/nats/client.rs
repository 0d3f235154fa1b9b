//! NATS client wrapper
//!
//! Connects to the broker with async-nats and exposes the connection through
//! the [`Connector`] / [`Connection`] / [`Subscription`] traits.
//!
//! Queued requests are read from a JetStream work-queue stream over every
//! session's request subject, so a request published while nobody was
//! listening can still be picked up for a short while.

use async_nats::jetstream::{self, consumer::PullConsumer};
use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::messages::all_requests_subject;
use super::transport::{Connection, Connector, Subscription};
use crate::config::BrokerConfig;
use crate::types::{BridgeError, Result};

/// Work-queue stream holding session requests
pub const WORK_QUEUE_STREAM: &str = "autopilot";

/// Durable consumer used to take one queued request at a time
pub const WORK_QUEUE_CONSUMER: &str = "autopilot-bridge-receiver";

/// How long a queued request stays on the stream
const WORK_QUEUE_MAX_AGE: Duration = Duration::from_secs(30);

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// How long to wait for the broker before giving up
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens one NATS connection per `connect` call
#[derive(Debug, Clone)]
pub struct NatsConnector {
    broker: BrokerConfig,
}

impl NatsConnector {
    /// Create a connector for the configured broker
    pub fn new(broker: BrokerConfig) -> Self {
        Self { broker }
    }

    /// Broker URL this connector dials
    pub fn url(&self) -> &str {
        &self.broker.url
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        debug!("Connecting to NATS at {}", self.broker.url);

        // No retry_on_initial_connect(): an unreachable broker fails the call
        let mut options = ConnectOptions::new()
            .name(&self.broker.client_name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(CONNECT_TIMEOUT);

        if let (Some(user), Some(pass)) = (&self.broker.user, &self.broker.password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options.connect(&self.broker.url).await?;

        info!("Connected to NATS at {}", self.broker.url);

        Ok(Box::new(NatsConnection {
            client: Mutex::new(Some(client)),
        }))
    }
}

/// Stream settings for the request work queue
pub fn work_queue_stream_config() -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: WORK_QUEUE_STREAM.to_string(),
        subjects: vec![all_requests_subject()],
        retention: jetstream::stream::RetentionPolicy::WorkQueue,
        storage: jetstream::stream::StorageType::File,
        max_age: WORK_QUEUE_MAX_AGE,
        discard: jetstream::stream::DiscardPolicy::Old,
        ..Default::default()
    }
}

/// A single async-nats client
///
/// The socket is torn down once the last clone of the client is dropped.
/// `close` flushes and drops the connection's own clone; anything used
/// afterwards fails with a connection error.
pub struct NatsConnection {
    client: Mutex<Option<Client>>,
}

impl NatsConnection {
    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| BridgeError::Connection("connection closed".to_string()))
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>> {
        let subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BridgeError::Subscribe(format!("Subscribe to {} failed: {}", subject, e)))?;

        Ok(Box::new(NatsSubscription {
            subscriber: Some(subscriber),
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let client = self.client()?;
        client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BridgeError::Publish(format!("Publish to {} failed: {}", subject, e)))?;

        // Push the request onto the wire before the caller starts waiting
        client
            .flush()
            .await
            .map_err(|e| BridgeError::Publish(format!("Flush failed: {}", e)))
    }

    async fn next_queued(&self, filter: &str, expires: Duration) -> Result<Option<Bytes>> {
        let jetstream = jetstream::new(self.client()?);

        let stream = jetstream
            .get_or_create_stream(work_queue_stream_config())
            .await
            .map_err(|e| BridgeError::Subscribe(format!("Failed to create stream: {e}")))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                WORK_QUEUE_CONSUMER,
                jetstream::consumer::pull::Config {
                    durable_name: Some(WORK_QUEUE_CONSUMER.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: filter.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BridgeError::Subscribe(format!("Failed to create consumer: {e}")))?;

        let taken = take_one(&consumer, expires).await;

        // The consumer only lives for one receive so the next filter can differ
        if let Err(e) = stream.delete_consumer(WORK_QUEUE_CONSUMER).await {
            warn!("Deleting consumer {} failed: {}", WORK_QUEUE_CONSUMER, e);
        }

        taken
    }

    async fn close(&self) -> Result<()> {
        let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(());
        };

        if let Err(e) = client.flush().await {
            warn!("Flush on close failed: {}", e);
        }
        drop(client);
        debug!("NATS connection closed");
        Ok(())
    }
}

/// Fetch and acknowledge at most one message
async fn take_one(consumer: &PullConsumer, expires: Duration) -> Result<Option<Bytes>> {
    let mut messages = consumer
        .fetch()
        .max_messages(1)
        .expires(expires)
        .messages()
        .await
        .map_err(|e| BridgeError::Subscribe(format!("Failed to fetch messages: {e}")))?;

    match messages.next().await {
        Some(Ok(msg)) => {
            msg.ack()
                .await
                .map_err(|e| BridgeError::Subscribe(format!("Ack failed: {e}")))?;
            debug!("Took queued message from {}", msg.subject);
            Ok(Some(msg.payload.clone()))
        }
        Some(Err(e)) => Err(BridgeError::Subscribe(format!("Error receiving message: {e}"))),
        None => Ok(None),
    }
}

/// Subscription backed by an async-nats subscriber
pub struct NatsSubscription {
    subscriber: Option<Subscriber>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        let subscriber = self.subscriber.as_mut()?;
        subscriber.next().await.map(|msg| Ok(msg.payload))
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        match self.subscriber.take() {
            Some(mut subscriber) => subscriber
                .unsubscribe()
                .await
                .map_err(|e| BridgeError::Subscribe(format!("Unsubscribe failed: {}", e))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Round trips against a live broker need a running nats-server; the
    // call path itself is covered through the in-process broker.

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let connector = NatsConnector::new(BrokerConfig {
            url: "nats://127.0.0.1:1".to_string(),
            ..BrokerConfig::default()
        });

        match connector.connect().await {
            Err(BridgeError::Connection(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[test]
    fn test_work_queue_covers_every_session() {
        let config = work_queue_stream_config();

        assert_eq!(config.name, "autopilot");
        assert_eq!(config.subjects, vec!["autopilot.request.>".to_string()]);
        assert!(matches!(
            config.retention,
            jetstream::stream::RetentionPolicy::WorkQueue
        ));
        assert_eq!(config.max_age, Duration::from_secs(30));
    }
}
