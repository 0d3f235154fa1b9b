//! Shared types for the autopilot bridge

pub mod error;

pub use error::{BridgeError, Result};
