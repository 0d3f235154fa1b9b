//! Autopilot bridge - command RPC for autopilot workers over NATS
//!
//! Relays shell/PowerShell command execution and session requests from a
//! backend to remote autopilot workers. NATS only offers fire-and-forget
//! publish/subscribe, so each call carries its own reply subject and waits
//! for a single answer on it within a fixed tick budget.
//!
//! ## Modules
//!
//! - **nats**: envelope, subjects, transport seam, waiter, bridge entry point
//! - **config**: CLI/environment configuration and the injected `BridgeConfig`
//! - **logging**: tracing setup and per-call structured events
//! - **types**: error type and result alias

pub mod config;
pub mod logging;
pub mod nats;
pub mod types;

pub use config::{Args, BridgeConfig, BrokerKind};
pub use nats::{Action, AutopilotBridge, CallRequest};
pub use types::{BridgeError, Result};
