// # ProxBalance
//
// Main entry point for the balancer binary: parses the CLI surface, loads
// and validates the configuration, initializes structured logging and
// hands control to the scheduler.

use clap::Parser;
use log::warn;
use proxbalance::config::{Config, DEFAULT_CONFIG_PATH};
use proxbalance::scheduler::{self, Scheduler};
use proxbalance::{Result, VERSION};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "proxbalance",
    about = "Workload rebalancer for Proxmox VE clusters",
    version = proxbalance::VERSION,
    disable_version_flag = true
)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Compute and print the plan without executing migrations
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,

    /// With --dry-run, emit the plan as JSON instead of text
    #[arg(short = 'j', long = "json")]
    json: bool,

    /// Print the best destination node for a new guest and exit
    #[arg(short = 'b', long = "best-node")]
    best_node: bool,

    /// Print version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("proxbalance: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.service.log_level.as_filter())
        .with_target(false)
        .init();

    info!("proxbalance {} starting", VERSION);

    match run(cli, config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<i32> {
    if cli.best_node {
        return match scheduler::query_best_node(&config).await? {
            Some(node) => {
                println!("{}", node);
                Ok(0)
            }
            None => {
                warn!("no eligible destination node in the cluster");
                Ok(1)
            }
        };
    }

    if cli.dry_run {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let outcome = scheduler::run_cycle(&config, true, shutdown_rx).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&outcome.plan.to_json())?);
        } else {
            print!("{}", outcome.plan.render_text());
        }
        return Ok(0);
    }

    Scheduler::new(config, cli.config).run().await?;
    Ok(0)
}
