//! Command line interface

use clap::Parser;
use std::path::PathBuf;

/// Muster replication runtime node
#[derive(Debug, Parser)]
#[command(name = "muster", about = "Muster replication runtime node")]
pub struct Cli {
    /// Port to bind the WebSocket endpoint to; without it the embedded
    /// smoke runner executes instead
    #[arg(long)]
    pub port: Option<u16>,

    /// URL of the master daemon to keep a connection to
    #[arg(long)]
    pub master_url: Option<String>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Optional JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parse the process arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        let cli = Cli::parse_from(["muster", "--port=9000"]);
        assert_eq!(cli.port, Some(9000));
        assert!(cli.master_url.is_none());
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["muster"]);
        assert_eq!(cli.port, None);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_master_url() {
        let cli = Cli::parse_from(["muster", "--port=9000", "--master-url=ws://master:9000"]);
        assert_eq!(cli.master_url.as_deref(), Some("ws://master:9000"));
    }
}
