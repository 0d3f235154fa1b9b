//! Autopilot bridge - command RPC over NATS
//!
//! Usage:
//!   autopilot-bridge exec --session host-42 -- Get-ChildItem -Force
//!   autopilot-bridge write '{"text":"exit"}'
//!   autopilot-bridge pull --session host-42
//!   autopilot-bridge receive --session host-42
//!   autopilot-bridge respond '{"reply_to":"autopilot.response.abc","stdout":"ok"}'
//!
//! The result (or a `{"errormessage": ...}` payload) is printed to stdout;
//! logs go to stderr.

use clap::Parser;
use tracing::info;

use autopilot_bridge::{
    config::{Args, BrokerKind, Command},
    logging,
    nats::{AutopilotBridge, CallRequest, StartCallback, StartNotice},
    Action, BridgeError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_format);

    args.validate().map_err(BridgeError::Config)?;

    let config = args.bridge_config();
    let connections = if config.pooled { "pooled" } else { "per-call" };
    match config.broker_kind {
        BrokerKind::Nats => info!("NATS: {} ({})", config.broker.url, connections),
        BrokerKind::Memory => info!("In-process broker ({})", connections),
    }

    let bridge = AutopilotBridge::from_config(config);

    let response = match args.command {
        Command::Exec {
            session,
            cwd,
            show_echo,
            command,
            args,
        } => {
            // Streaming output only makes sense when someone follows the echo subject
            let (action, on_start): (Action, Option<StartCallback>) = if show_echo {
                (
                    Action::Execute,
                    Some(Box::new(|notice: StartNotice| eprintln!("echo: {}", notice.echo_subject))),
                )
            } else {
                (Action::ExecuteNostream, None)
            };
            let request = CallRequest::new(session, action, command)
                .with_args(args)
                .with_cwd(cwd);
            bridge
                .call(request, bridge.config().rpc_budget(), on_start)
                .await
        }
        Command::Write { session, args } => bridge.write(&session, args).await,
        Command::Pull { session } => bridge.pull_session(&session).await,
        Command::Receive { session } => bridge.receive_queued(session.as_deref()).await,
        Command::Respond { reply_to, body } => match reply_to {
            Some(reply_to) => bridge.respond(&reply_to, body).await,
            None => bridge.relay(&body).await,
        },
    };

    println!("{}", response);
    Ok(())
}
