//! NATS message types for autopilot requests
//!
//! Defines the request envelope published to workers and the subject
//! conventions that address a session's request queue and a call's
//! private reply subject.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{BridgeError, Result};

/// Subject prefix for requests, scoped by session id
pub const REQUEST_SUBJECT_PREFIX: &str = "autopilot.request";

/// Subject prefix for per-call reply subjects, scoped by correlation id
pub const RESPONSE_SUBJECT_PREFIX: &str = "autopilot.response";

/// Suffix of the secondary "start" notification subject
pub const ECHO_SUFFIX: &str = "echo";

/// Worker-side behavior requested by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Run a command and reply once with the collected output
    ExecuteNostream,
    /// Run a command, streaming output on the echo subject
    Execute,
    /// Write input to the session; carries no command
    Write,
}

impl Action {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteNostream => "execute-nostream",
            Self::Execute => "execute",
            Self::Write => "write",
        }
    }

    /// Whether an envelope with this action must carry a command
    pub fn requires_command(&self) -> bool {
        matches!(self, Self::ExecuteNostream | Self::Execute)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execute-nostream" => Ok(Self::ExecuteNostream),
            "execute" => Ok(Self::Execute),
            "write" => Ok(Self::Write),
            other => Err(BridgeError::Validation(format!("unknown action: {other}"))),
        }
    }
}

/// Request envelope published to `autopilot.request.<session_id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Logical remote session / worker queue
    pub session_id: String,
    /// Worker-side behavior
    pub action: Action,
    /// Program or command to run
    pub command: String,
    /// Command arguments, in order
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Private subject the worker publishes its response to
    pub reply_to: String,
}

impl RequestEnvelope {
    /// Create an envelope addressed back to `reply_to`
    pub fn new(
        session_id: impl Into<String>,
        action: Action,
        command: impl Into<String>,
        args: Vec<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            action,
            command: command.into(),
            args,
            cwd: None,
            reply_to: reply_to.into(),
        }
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Get the NATS subject for this request
    pub fn subject(&self) -> String {
        request_subject(&self.session_id)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Subjects of every session's requests
pub fn all_requests_subject() -> String {
    format!("{REQUEST_SUBJECT_PREFIX}.>")
}

/// Request subject for a session
pub fn request_subject(session_id: &str) -> String {
    format!("{REQUEST_SUBJECT_PREFIX}.{session_id}")
}

/// Reject reply subjects a response could not be published to
pub fn validate_reply_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(BridgeError::Validation("missing reply_to".to_string()));
    }
    if subject.split('.').any(|token| {
        token.is_empty() || token == "*" || token == ">" || token.chars().any(char::is_whitespace)
    }) {
        return Err(BridgeError::Validation(format!(
            "invalid reply subject: {subject}"
        )));
    }
    Ok(())
}

/// Reject session ids that would not form a single subject token
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(BridgeError::Validation("empty session id".to_string()));
    }
    if session_id
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(BridgeError::Validation(format!(
            "invalid session id: {session_id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_subject() {
        let env = RequestEnvelope::new(
            "sess-1",
            Action::ExecuteNostream,
            "ls",
            vec![],
            "autopilot.response.abc",
        );
        assert_eq!(env.subject(), "autopilot.request.sess-1");
    }

    #[test]
    fn test_envelope_wire_format() {
        let env = RequestEnvelope::new(
            "sess-1",
            Action::ExecuteNostream,
            "Get-ChildItem",
            vec!["-Force".to_string()],
            "autopilot.response.abc",
        );
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(value["session_id"], "sess-1");
        assert_eq!(value["action"], "execute-nostream");
        assert_eq!(value["command"], "Get-ChildItem");
        assert_eq!(value["args"], serde_json::json!(["-Force"]));
        assert_eq!(value["reply_to"], "autopilot.response.abc");
        assert!(value.get("cwd").is_none());
    }

    #[test]
    fn test_envelope_with_cwd() {
        let env = RequestEnvelope::new("s", Action::Write, "echo", vec![], "r")
            .with_cwd(Some("C:\\work".to_string()));
        let decoded = RequestEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.cwd.as_deref(), Some("C:\\work"));
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("write".parse::<Action>().unwrap(), Action::Write);
        assert_eq!(
            "execute-nostream".parse::<Action>().unwrap(),
            Action::ExecuteNostream
        );
        assert!("delete".parse::<Action>().is_err());
    }

    #[test]
    fn test_only_execute_needs_a_command() {
        assert!(Action::ExecuteNostream.requires_command());
        assert!(Action::Execute.requires_command());
        assert!(!Action::Write.requires_command());
        assert!("pull".parse::<Action>().is_err());
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("host-42").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a.b").is_err());
        assert!(validate_session_id("a*").is_err());
        assert!(validate_session_id("a >").is_err());
    }

    #[test]
    fn test_validate_reply_subject() {
        assert!(validate_reply_subject("autopilot.response.abc").is_ok());
        assert!(validate_reply_subject("_INBOX.x1").is_ok());
        assert!(validate_reply_subject("").is_err());
        assert!(validate_reply_subject("autopilot.response.*").is_err());
        assert!(validate_reply_subject("autopilot..x").is_err());
        assert!(validate_reply_subject("a b").is_err());
    }
}
