//! NATS messaging layer for the autopilot bridge
//!
//! Correlation-based request/response on top of plain publish/subscribe:
//! requests go to `autopilot.request.<session_id>`, replies come back on a
//! private `autopilot.response.<correlation_id>` subject. The request
//! subjects double as a JetStream work queue for receivers that were not
//! listening when a request went out.

pub mod bridge;
pub mod client;
pub mod correlation;
pub mod memory;
pub mod messages;
pub mod pool;
pub mod transport;
pub mod waiter;

pub use bridge::{AutopilotBridge, CallRequest, CallState, StartCallback, StartNotice};
pub use client::{NatsConnector, WORK_QUEUE_STREAM};
pub use correlation::CorrelationId;
pub use memory::MemoryBroker;
pub use messages::{Action, RequestEnvelope};
pub use pool::PooledConnector;
pub use transport::{Connection, Connector, Subscription};
pub use waiter::{WaitBudget, WaitOutcome};
