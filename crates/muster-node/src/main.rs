//! Muster node binary
//!
//! With `--port=N` the process runs as a daemon bound to that port; without
//! it the embedded smoke runner executes.

mod cli;
mod config;
mod node;
mod smoke;

use anyhow::Result;
use cli::Cli;
use config::NodeConfig;
use node::Node;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    let config = config.merge_cli(cli.port, cli.master_url);

    if config.port.is_some() {
        let node = Node::start(&config).await?;
        node.run().await
    } else {
        smoke::run().await
    }
}
