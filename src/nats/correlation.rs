//! Correlation ids and the private reply subjects built from them

use std::fmt;
use uuid::Uuid;

use super::messages::{ECHO_SUFFIX, RESPONSE_SUBJECT_PREFIX};

/// Unique identifier for one outbound call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Subject the worker publishes the response to
    pub fn reply_subject(&self) -> String {
        format!("{RESPONSE_SUBJECT_PREFIX}.{}", self.0)
    }

    /// Subject for the secondary start/echo channel
    pub fn echo_subject(&self) -> String {
        format!("{RESPONSE_SUBJECT_PREFIX}.{}.{ECHO_SUFFIX}", self.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_subjects() {
        let id = CorrelationId::new();
        assert_eq!(id.reply_subject(), format!("autopilot.response.{id}"));
        assert_eq!(id.echo_subject(), format!("autopilot.response.{id}.echo"));
        assert!(!id.as_str().contains('.'));
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
