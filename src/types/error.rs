//! Error types for the autopilot bridge
//!
//! Every failure inside the bridge is a `BridgeError`. The public entry point
//! never hands these out directly; it turns them into the canonical JSON
//! payloads the backend already understands (`{"errormessage": ...}`).

/// Main error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no command")]
    NoCommand,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("No response on {subject} after {ticks} ticks")]
    Timeout { subject: String, ticks: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Message placed in the `errormessage` field of the error payload
    pub fn error_message(&self) -> String {
        match self {
            Self::NoCommand => "no command".to_string(),
            Self::Timeout { .. } => "timeout".to_string(),
            other => other.to_string(),
        }
    }

    /// Render as the JSON error payload returned to callers
    pub fn to_payload(&self) -> String {
        serde_json::json!({ "errormessage": self.error_message() }).to_string()
    }

    /// Short label used in structured call logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCommand | Self::Validation(_) => "validation",
            Self::Connection(_) => "connection",
            Self::Publish(_) => "publish",
            Self::Subscribe(_) => "subscribe",
            Self::Timeout { .. } => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<async_nats::ConnectError> for BridgeError {
    fn from(err: async_nats::ConnectError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
