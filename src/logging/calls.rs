//! Structured call records
//!
//! One `CallEvent` is emitted per bridge operation, whatever the outcome, so a
//! log pipeline can count timeouts and failures per session and operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// How a call ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Worker replied
    Replied,
    /// No reply within the wait budget
    TimedOut,
    /// Rejected before any I/O
    Rejected,
    /// Connect, subscribe, publish or queue access failed
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::TimedOut => "timed_out",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Record of a completed bridge operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Session id, or the reply subject for relayed responses
    pub target: String,
    /// Action wire name (`execute`, `write`, ...) or `pull`, `receive`, `respond`
    pub operation: String,
    /// Correlation id, absent when the call was rejected before one was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// How the call ended
    pub outcome: CallOutcome,
    /// Wall-clock duration of the call
    pub duration_ms: u64,
    /// Response size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Error label for failed calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallEvent {
    /// Create a new call event
    pub fn new(target: &str, operation: &str, outcome: CallOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            target: target.to_string(),
            operation: operation.to_string(),
            correlation_id: None,
            outcome,
            duration_ms: 0,
            bytes: None,
            error: None,
        }
    }

    /// Set the correlation id
    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Set the response size
    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes as u64);
        self
    }

    /// Set the error label
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Emit through tracing
    pub fn emit(&self) {
        let correlation_id = self.correlation_id.as_deref().unwrap_or("-");
        let error = self.error.as_deref().unwrap_or("");

        match self.outcome {
            CallOutcome::Replied => info!(
                target = %self.target,
                operation = %self.operation,
                correlation_id,
                outcome = self.outcome.as_str(),
                duration_ms = self.duration_ms,
                bytes = self.bytes.unwrap_or(0),
                "bridge operation completed"
            ),
            _ => warn!(
                target = %self.target,
                operation = %self.operation,
                correlation_id,
                outcome = self.outcome.as_str(),
                duration_ms = self.duration_ms,
                error,
                "bridge operation did not complete"
            ),
        }
    }
}
