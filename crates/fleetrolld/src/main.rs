//! fleetrolld: the fleetroll daemon binary.
//!
//! # Usage
//!
//! ```text
//! fleetrolld --config /etc/fleetroll/fleetrolld.toml run
//! fleetrolld --config /etc/fleetroll/fleetrolld.toml approve myfleet
//! fleetrolld --config /etc/fleetroll/fleetrolld.toml status myfleet
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetroll_rollout::{ApprovalMethod, ChannelNotifier};
use fleetrolld::commands;
use fleetrolld::config::{DaemonConfig, LogConfig};
use fleetrolld::daemon;

#[derive(Parser)]
#[command(name = "fleetrolld", about = "fleetroll rollout daemon")]
struct Cli {
    /// Configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run both reconcilers periodically until Ctrl-C.
    Run,

    /// Run one pass of each reconciler and exit.
    Reconcile,

    /// Approve the current batch of a fleet.
    Approve {
        fleet: String,
    },

    /// Switch a fleet between manual and automatic batch approval.
    ApprovalMethod {
        fleet: String,

        /// `manual` or `automatic`.
        method: ApprovalMethod,
    },

    /// Print the rollout state of a fleet as JSON.
    Status {
        fleet: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log)?;

    let store = commands::open_store(&config)?;
    let org_id = config.org_id.as_str();

    match cli.command {
        Command::Run => {
            daemon::run(&config, store, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl-C");
                }
            })
            .await
        }
        Command::Reconcile => {
            let (notifier, mut events) = ChannelNotifier::new();
            let result = commands::reconcile_once(&store, org_id, Arc::new(notifier));
            while let Ok(event) = events.try_recv() {
                println!("{}", serde_json::to_string(&event)?);
            }
            result
        }
        Command::Approve { fleet } => commands::approve(&store, org_id, &fleet),
        Command::ApprovalMethod { fleet, method } => {
            commands::set_approval_method(&store, org_id, &fleet, method)
        }
        Command::Status { fleet } => {
            let status = commands::status(&store, org_id, &fleet)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.filter)?,
    };
    // stdout is reserved for command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
