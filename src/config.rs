//! Configuration for the autopilot bridge
//!
//! CLI arguments and environment variable handling using clap. The parsed
//! arguments are turned into a [`BridgeConfig`] that is injected into the
//! bridge at construction; nothing reads the environment after startup.

use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;

use crate::nats::waiter::{WaitBudget, PULL_TICKS, RPC_TICKS};

/// Broker address used when neither `NATS_URL` nor `NATS` is set
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Autopilot bridge - command RPC over NATS
#[derive(Parser, Debug, Clone)]
#[command(name = "autopilot-bridge")]
#[command(about = "Relay command execution and session requests to autopilot workers over NATS")]
#[command(version)]
pub struct Args {
    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Length of one wait tick in milliseconds
    #[arg(long, env = "TICK_INTERVAL_MS", default_value = "1000")]
    pub tick_interval_ms: u64,

    /// Ticks a command RPC waits for its reply
    #[arg(long, env = "RPC_TICKS", default_value_t = RPC_TICKS)]
    pub rpc_ticks: u32,

    /// Ticks a session pull waits for its reply
    #[arg(long, env = "PULL_TICKS", default_value_t = PULL_TICKS)]
    pub pull_ticks: u32,

    /// Broker to talk to
    #[arg(long, env = "BROKER", value_enum, default_value = "nats")]
    pub broker: BrokerKind,

    /// Share one broker connection across calls instead of one per call
    #[arg(long, env = "POOLED", default_value = "false")]
    pub pooled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS server URL, older variable name; used when `NATS_URL` is unset
    #[arg(long, env = "NATS", hide = true)]
    pub nats_server: Option<String>,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Which broker the bridge talks to
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerKind {
    /// A NATS server
    #[default]
    Nats,
    /// An in-process broker, for dry runs without nats-server
    Memory,
}

/// Bridge operations exposed on the command line
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a command on a session's worker and print the reply
    Exec {
        /// Target session id
        #[arg(long, short)]
        session: String,

        /// Working directory on the worker
        #[arg(long)]
        cwd: Option<String>,

        /// Request streamed output and print the echo subject to stderr
        #[arg(long)]
        show_echo: bool,

        /// Command to run
        command: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Write input to a session
    Write {
        /// Target session id
        #[arg(long, short, default_value = "auto")]
        session: String,

        /// Input to write, one argument each
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Wait for the next request published to a session and print it
    Pull {
        /// Target session id
        #[arg(long, short)]
        session: String,
    },

    /// Take the next request held on the request work queue
    Receive {
        /// Only take requests for this session
        #[arg(long, short)]
        session: Option<String>,
    },

    /// Publish a response body to a waiting caller
    Respond {
        /// Reply subject; read from the body's `reply_to` field when omitted
        #[arg(long)]
        reply_to: Option<String>,

        /// Response body
        body: String,
    },
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Client name reported to the broker
    pub client_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_NATS_URL.to_string(),
            user: None,
            password: None,
            client_name: "autopilot-bridge".to_string(),
        }
    }
}

/// Settings injected into the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    /// Length of one wait tick
    pub tick_interval: Duration,
    /// Wait budget for command RPC calls, in ticks
    pub rpc_ticks: u32,
    /// Wait budget for session pulls, in ticks
    pub pull_ticks: u32,
    /// Broker to talk to
    pub broker_kind: BrokerKind,
    /// Share one connection across calls
    pub pooled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            tick_interval: Duration::from_secs(1),
            rpc_ticks: RPC_TICKS,
            pull_ticks: PULL_TICKS,
            broker_kind: BrokerKind::Nats,
            pooled: false,
        }
    }
}

impl BridgeConfig {
    /// Wait budget for command RPC calls
    pub fn rpc_budget(&self) -> WaitBudget {
        WaitBudget::new(self.rpc_ticks, self.tick_interval)
    }

    /// Wait budget for session pulls
    pub fn pull_budget(&self) -> WaitBudget {
        WaitBudget::new(self.pull_ticks, self.tick_interval)
    }
}

impl NatsArgs {
    /// Broker settings: `NATS_URL`, then `NATS`, then the default URL
    ///
    /// Blank values count as unset.
    pub fn broker_config(&self) -> BrokerConfig {
        let url = [&self.nats_url, &self.nats_server]
            .into_iter()
            .flatten()
            .map(|url| url.trim())
            .find(|url| !url.is_empty())
            .unwrap_or(DEFAULT_NATS_URL)
            .to_string();

        BrokerConfig {
            url,
            user: self.nats_user.clone(),
            password: self.nats_password.clone(),
            ..BrokerConfig::default()
        }
    }
}

impl Args {
    /// Build the configuration injected into the bridge
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            broker: self.nats.broker_config(),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            rpc_ticks: self.rpc_ticks,
            pull_ticks: self.pull_ticks,
            broker_kind: self.broker,
            pooled: self.pooled,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("TICK_INTERVAL_MS must be greater than zero".to_string());
        }

        if self.rpc_ticks == 0 || self.pull_ticks == 0 {
            return Err("RPC_TICKS and PULL_TICKS must be greater than zero".to_string());
        }

        if self.nats.nats_user.is_some() != self.nats.nats_password.is_some() {
            return Err("NATS_USER and NATS_PASSWORD must be set together".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["autopilot-bridge"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["pull", "--session", "s1"]);
        let config = args.bridge_config();

        assert_eq!(config.rpc_budget(), WaitBudget::new(5, Duration::from_secs(1)));
        assert_eq!(config.pull_budget(), WaitBudget::new(30, Duration::from_secs(1)));
        assert!(!config.pooled);
        assert_eq!(config.broker_kind, BrokerKind::Nats);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_exec_keeps_hyphenated_args() {
        let args = parse(&["exec", "-s", "s1", "--cwd", "/tmp", "--", "ls", "-la", "/var"]);
        match args.command {
            Command::Exec {
                session,
                cwd,
                command,
                args,
                show_echo,
            } => {
                assert_eq!(session, "s1");
                assert_eq!(cwd.as_deref(), Some("/tmp"));
                assert_eq!(command, "ls");
                assert_eq!(args, vec!["-la", "/var"]);
                assert!(!show_echo);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn nats_args(nats_url: Option<&str>, nats_server: Option<&str>) -> NatsArgs {
        NatsArgs {
            nats_url: nats_url.map(String::from),
            nats_server: nats_server.map(String::from),
            nats_user: None,
            nats_password: None,
        }
    }

    #[test]
    fn test_blank_url_falls_back_to_default() {
        assert_eq!(nats_args(Some("  "), None).broker_config().url, DEFAULT_NATS_URL);
        assert_eq!(nats_args(None, None).broker_config().url, DEFAULT_NATS_URL);
    }

    #[test]
    fn test_nats_url_wins_over_nats() {
        let both = nats_args(Some("nats://primary:4222"), Some("nats://legacy:4222"));
        assert_eq!(both.broker_config().url, "nats://primary:4222");

        let legacy_only = nats_args(Some(""), Some(" nats://legacy:4222 "));
        assert_eq!(legacy_only.broker_config().url, "nats://legacy:4222");
    }

    #[test]
    fn test_nats_env_var_sets_broker_url() {
        std::env::set_var("NATS", "nats://from-env:4222");
        let args = Args::try_parse_from(["autopilot-bridge", "pull", "-s", "s1"]);
        std::env::remove_var("NATS");

        let args = args.unwrap();
        if args.nats.nats_url.is_none() {
            assert_eq!(args.bridge_config().broker.url, "nats://from-env:4222");
        }
        assert_eq!(args.nats.nats_server.as_deref(), Some("nats://from-env:4222"));
    }

    #[test]
    fn test_write_defaults_to_auto_session() {
        let args = parse(&["write", "--", r#"{"text":"hi"}"#, "-n"]);
        match args.command {
            Command::Write { session, args } => {
                assert_eq!(session, "auto");
                assert_eq!(args, vec![r#"{"text":"hi"}"#, "-n"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_respond_and_receive_parse() {
        let args = parse(&["respond", "--reply-to", "autopilot.response.abc", "done"]);
        match args.command {
            Command::Respond { reply_to, body } => {
                assert_eq!(reply_to.as_deref(), Some("autopilot.response.abc"));
                assert_eq!(body, "done");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let args = parse(&["--broker", "memory", "receive"]);
        assert_eq!(args.bridge_config().broker_kind, BrokerKind::Memory);
        assert!(matches!(args.command, Command::Receive { session: None }));
    }

    #[test]
    fn test_validate_rejects_zero_ticks() {
        let mut args = parse(&["pull", "-s", "s1"]);
        args.rpc_ticks = 0;
        assert!(args.validate().is_err());

        let mut args = parse(&["pull", "-s", "s1"]);
        args.tick_interval_ms = 0;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_requires_credential_pair() {
        let mut args = parse(&["pull", "-s", "s1"]);
        args.nats.nats_user = Some("bridge".to_string());
        assert!(args.validate().is_err());

        args.nats.nats_password = Some("secret".to_string());
        assert!(args.validate().is_ok());
    }
}
