//! Autopilot bridge - correlation-based RPC over NATS
//!
//! Publishes a request envelope to a session's request subject and waits for
//! the worker's reply on a private, per-call subject:
//!
//! ```text
//! idle -> connecting -> subscribed -> waiting -> resolved | timed-out -> closed
//! ```
//!
//! The reply subscription is always in place before the request goes out, so
//! a fast worker cannot answer into the void. Every path through a call ends
//! in `closed`: the subscription is torn down and the connection released.
//!
//! The same connect/close discipline covers the other operations:
//!
//! - `pull_session` listens on a session's request subject, publishing
//!   nothing, and returns the first request a producer sends there
//! - `receive_queued` takes a request held on the JetStream work queue
//! - `respond` publishes a worker's response to a caller's reply subject
//!
//! The public entry points never fail. Whatever happens, the caller gets a
//! string back: the payload verbatim, or a JSON error payload such as
//! `{"errormessage":"timeout"}`.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::client::NatsConnector;
use super::correlation::CorrelationId;
use super::memory::MemoryBroker;
use super::messages::{
    all_requests_subject, request_subject, validate_reply_subject, validate_session_id, Action,
    RequestEnvelope,
};
use super::pool::PooledConnector;
use super::transport::{Connection, Connector, Subscription};
use super::waiter::{wait_for_reply, WaitBudget, WaitOutcome};
use crate::config::{BridgeConfig, BrokerKind};
use crate::logging::{CallEvent, CallOutcome};
use crate::types::{BridgeError, Result};

/// Per-call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Subscribed,
    Waiting,
    Resolved,
    TimedOut,
    Closed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Waiting => "waiting",
            Self::Resolved => "resolved",
            Self::TimedOut => "timed-out",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Sent to the start callback once the request is on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartNotice {
    pub correlation_id: String,
    /// Subject the final reply arrives on
    pub reply_to: String,
    /// Subject the worker streams start/echo output on
    pub echo_subject: String,
}

/// Invoked once per call, after publish and before the wait
pub type StartCallback = Box<dyn FnOnce(StartNotice) + Send>;

/// One request to a session's worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub session_id: String,
    pub action: Action,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

impl CallRequest {
    /// Create a request with no arguments
    pub fn new(session_id: impl Into<String>, action: Action, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            action,
            command: command.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Set the command arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Check the request before any I/O happens
    pub fn validate(&self) -> Result<()> {
        if self.action.requires_command() && self.command.is_empty() {
            return Err(BridgeError::NoCommand);
        }
        validate_session_id(&self.session_id)
    }

    fn envelope(&self, reply_to: String) -> RequestEnvelope {
        RequestEnvelope::new(
            self.session_id.clone(),
            self.action,
            self.command.clone(),
            self.args.clone(),
            reply_to,
        )
        .with_cwd(self.cwd.clone())
    }
}

/// Request/response bridge to autopilot workers
#[derive(Clone)]
pub struct AutopilotBridge {
    connector: Arc<dyn Connector>,
    config: BridgeConfig,
}

impl AutopilotBridge {
    /// Create a bridge over an explicit connector
    pub fn new(config: BridgeConfig, connector: Arc<dyn Connector>) -> Self {
        Self { connector, config }
    }

    /// Create a bridge that talks to the configured broker
    pub fn from_config(config: BridgeConfig) -> Self {
        let direct: Arc<dyn Connector> = match config.broker_kind {
            BrokerKind::Nats => Arc::new(NatsConnector::new(config.broker.clone())),
            BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        };
        let connector: Arc<dyn Connector> = if config.pooled {
            Arc::new(PooledConnector::new(direct))
        } else {
            direct
        };
        Self::new(config, connector)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run a command and wait for its collected output
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        args: Vec<String>,
        cwd: Option<String>,
    ) -> String {
        let request = CallRequest::new(session_id, Action::ExecuteNostream, command)
            .with_args(args)
            .with_cwd(cwd);
        self.call(request, self.config.rpc_budget(), None).await
    }

    /// Write input to a session
    ///
    /// The envelope carries an empty command; the input travels in `args`.
    pub async fn write(&self, session_id: &str, args: Vec<String>) -> String {
        let request = CallRequest::new(session_id, Action::Write, "").with_args(args);
        self.call(request, self.config.rpc_budget(), None).await
    }

    /// Wait for the next request published to a session, with the pull budget
    ///
    /// Nothing is published. The first payload seen on
    /// `autopilot.request.<session_id>` is returned verbatim.
    pub async fn pull_session(&self, session_id: &str) -> String {
        let started = Instant::now();
        let result = self.try_pull(session_id, self.config.pull_budget()).await;
        finish(session_id, "pull", None, started, result)
    }

    /// Take the next request held on the request work queue
    ///
    /// With a session id only that session's requests are taken; without
    /// one, any session's. Waits up to the pull budget.
    pub async fn receive_queued(&self, session_id: Option<&str>) -> String {
        let started = Instant::now();
        let target = session_id.unwrap_or("*");
        let result = self
            .try_receive_queued(session_id, self.config.pull_budget())
            .await;
        finish(target, "receive", None, started, result)
    }

    /// Publish a response body to a caller's reply subject
    ///
    /// Returns `{"success":true}` once the body is on the wire.
    pub async fn respond(&self, reply_to: &str, body: impl Into<Bytes>) -> String {
        let started = Instant::now();
        let result = self.try_respond(reply_to, body.into()).await;
        finish(reply_to, "respond", None, started, result)
    }

    /// Relay a JSON response body to the subject named by its `reply_to` field
    pub async fn relay(&self, body: &str) -> String {
        match reply_subject_of(body) {
            Ok(reply_to) => self.respond(&reply_to, body.to_string()).await,
            Err(e) => finish("-", "respond", None, Instant::now(), Err(e)),
        }
    }

    /// Run one call to completion and return the reply or an error payload
    pub async fn call(
        &self,
        request: CallRequest,
        budget: WaitBudget,
        on_start: Option<StartCallback>,
    ) -> String {
        let started = Instant::now();
        let correlation = CorrelationId::new();

        let result = self
            .try_call(&request, &correlation, budget, on_start)
            .await;

        finish(
            &request.session_id,
            request.action.as_str(),
            Some(&correlation),
            started,
            result,
        )
    }

    /// Run one call, surfacing failures as `BridgeError`
    pub async fn try_call(
        &self,
        request: &CallRequest,
        correlation: &CorrelationId,
        budget: WaitBudget,
        on_start: Option<StartCallback>,
    ) -> Result<String> {
        let key = correlation.as_str();
        trace_state(key, CallState::Idle);
        request.validate()?;

        let envelope = request.envelope(correlation.reply_subject());
        let payload = envelope.to_bytes()?;

        trace_state(key, CallState::Connecting);
        let conn = self.connector.connect().await?;

        let result = exchange(
            conn.as_ref(),
            correlation,
            &envelope,
            payload,
            budget,
            on_start,
        )
        .await;

        close(conn.as_ref(), key).await;
        result
    }

    /// Listen on a session's request subject, surfacing failures as `BridgeError`
    pub async fn try_pull(&self, session_id: &str, budget: WaitBudget) -> Result<String> {
        validate_session_id(session_id)?;
        let subject = request_subject(session_id);

        trace_state(&subject, CallState::Connecting);
        let conn = self.connector.connect().await?;

        let result = listen(conn.as_ref(), &subject, budget).await;

        close(conn.as_ref(), &subject).await;
        result
    }

    /// Take one queued request, surfacing failures as `BridgeError`
    pub async fn try_receive_queued(
        &self,
        session_id: Option<&str>,
        budget: WaitBudget,
    ) -> Result<String> {
        let filter = match session_id {
            Some(session_id) => {
                validate_session_id(session_id)?;
                request_subject(session_id)
            }
            None => all_requests_subject(),
        };

        trace_state(&filter, CallState::Connecting);
        let conn = self.connector.connect().await?;
        trace_state(&filter, CallState::Waiting);

        let result = conn.next_queued(&filter, budget.total()).await;

        close(conn.as_ref(), &filter).await;

        match result? {
            Some(payload) => {
                trace_state(&filter, CallState::Resolved);
                Ok(String::from_utf8_lossy(&payload).into_owned())
            }
            None => {
                trace_state(&filter, CallState::TimedOut);
                Err(BridgeError::Timeout {
                    subject: filter,
                    ticks: budget.ticks,
                })
            }
        }
    }

    /// Publish one response, surfacing failures as `BridgeError`
    pub async fn try_respond(&self, reply_to: &str, body: Bytes) -> Result<String> {
        validate_reply_subject(reply_to)?;

        trace_state(reply_to, CallState::Connecting);
        let conn = self.connector.connect().await?;

        let result = conn.publish(reply_to, body).await;
        if result.is_ok() {
            debug!("Relayed response to {}", reply_to);
        }

        close(conn.as_ref(), reply_to).await;
        result.map(|()| serde_json::json!({ "success": true }).to_string())
    }
}

/// Subscribe, publish, wait, unsubscribe
async fn exchange(
    conn: &dyn Connection,
    correlation: &CorrelationId,
    envelope: &RequestEnvelope,
    payload: Bytes,
    budget: WaitBudget,
    on_start: Option<StartCallback>,
) -> Result<String> {
    let key = correlation.as_str();
    let reply_to = envelope.reply_to.as_str();
    let mut subscription: Box<dyn Subscription> = conn.subscribe(reply_to).await?;
    trace_state(key, CallState::Subscribed);

    let subject = envelope.subject();
    if let Err(e) = conn.publish(&subject, payload).await {
        unsubscribe(subscription.as_mut(), reply_to).await;
        return Err(e);
    }
    debug!(
        "Published {} request {} to {} (reply: {})",
        envelope.action, correlation, subject, reply_to
    );
    trace_state(key, CallState::Waiting);

    if let Some(on_start) = on_start {
        on_start(StartNotice {
            correlation_id: correlation.to_string(),
            reply_to: reply_to.to_string(),
            echo_subject: correlation.echo_subject(),
        });
    }

    first_message(subscription.as_mut(), budget, reply_to).await
}

/// Subscribe and wait, without publishing anything
async fn listen(conn: &dyn Connection, subject: &str, budget: WaitBudget) -> Result<String> {
    let mut subscription: Box<dyn Subscription> = conn.subscribe(subject).await?;
    trace_state(subject, CallState::Subscribed);
    trace_state(subject, CallState::Waiting);
    first_message(subscription.as_mut(), budget, subject).await
}

/// Wait for the first message on `subscription`, then tear it down
async fn first_message(
    subscription: &mut dyn Subscription,
    budget: WaitBudget,
    subject: &str,
) -> Result<String> {
    let outcome = wait_for_reply(subscription, budget, subject).await;
    unsubscribe(subscription, subject).await;

    match outcome {
        WaitOutcome::Message(payload) => {
            trace_state(subject, CallState::Resolved);
            Ok(String::from_utf8_lossy(&payload).into_owned())
        }
        WaitOutcome::TimedOut => {
            trace_state(subject, CallState::TimedOut);
            Err(BridgeError::Timeout {
                subject: subject.to_string(),
                ticks: budget.ticks,
            })
        }
    }
}

async fn unsubscribe(subscription: &mut dyn Subscription, subject: &str) {
    if let Err(e) = subscription.unsubscribe().await {
        warn!("Unsubscribe from {} failed: {}", subject, e);
    }
}

async fn close(conn: &dyn Connection, key: &str) {
    if let Err(e) = conn.close().await {
        warn!("Closing connection for {} failed: {}", key, e);
    }
    trace_state(key, CallState::Closed);
}

/// Turn an operation's result into the caller's string and log it
fn finish(
    target: &str,
    operation: &str,
    correlation: Option<&CorrelationId>,
    started: Instant,
    result: Result<String>,
) -> String {
    let (payload, event) = match result {
        Ok(reply) => {
            let event = CallEvent::new(target, operation, CallOutcome::Replied).with_bytes(reply.len());
            (reply, event)
        }
        Err(e) => {
            let outcome = match e {
                BridgeError::Timeout { .. } => CallOutcome::TimedOut,
                BridgeError::NoCommand | BridgeError::Validation(_) => CallOutcome::Rejected,
                _ => CallOutcome::Failed,
            };
            let event = CallEvent::new(target, operation, outcome).with_error(e.kind());
            (e.to_payload(), event)
        }
    };

    let correlation_id = match event.outcome {
        CallOutcome::Rejected => None,
        _ => correlation.map(ToString::to_string),
    };
    event
        .with_correlation(correlation_id)
        .with_duration(started.elapsed())
        .emit();

    payload
}

/// Read the `reply_to` field of a JSON response body
fn reply_subject_of(body: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    value
        .get("reply_to")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| BridgeError::Validation("missing reply_to".to_string()))
}

fn trace_state(key: &str, state: CallState) {
    debug!(call = key, state = %state, "call state");
}
