#![warn(missing_docs)]

//! `castore` binary: runs a storage node or prints its configuration.

use anyhow::Result;
use castore_node::cli::{Cli, Command};
use castore_node::NodeRuntime;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => {
            let config = args.load()?;
            tracing::info!("castore node {} starting...", config.name);
            let runtime = NodeRuntime::start(config).await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            runtime.shutdown().await;
            Ok(())
        }
        Command::Config(args) => {
            let config = args.load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
