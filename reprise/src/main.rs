//! Reprise - build and test FreeBSD ports in throwaway jails
//!
//! Usage:
//!   reprise run www/nginx devel/git       Build and test ports
//!   reprise run -j all -f ports.txt       Build a list on every environment
//!   reprise plan www/nginx                Show the job graph
//!   reprise environments                  List configured environments
//!   reprise cleanup                       Destroy clones left by crashed runs
//!   reprise options www/nginx             Show option combinations

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;
mod ports;

use commands::{Cli, Commands};

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(verbose > 1)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(config, args).await,
        Commands::Plan(args) => commands::plan::execute(config, args).await.map(|()| 0),
        Commands::Environments => commands::environments::execute(config).map(|()| 0),
        Commands::Cleanup { dry_run } => commands::cleanup::execute(config, dry_run).await.map(|()| 0),
        Commands::Options { port, include, exclude } => {
            commands::options::execute(config, &port, include, exclude)
                .await
                .map(|()| 0)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
