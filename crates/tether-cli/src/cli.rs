//! Command-line definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Tether: authenticated peer-to-peer service sessions"
)]
pub struct Cli {
    /// Path to config file (defaults to ~/.tether/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new secret key and print it with its peer address.
    Keygen,
    /// Print the peer address derived from the configured secret key.
    Address,
    /// Run a peer until interrupted.
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_config() {
        let cli = Cli::try_parse_from(["tether", "run", "--config", "/tmp/peer.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/peer.toml")));
    }

    #[test]
    fn test_parse_keygen_without_config() {
        let cli = Cli::try_parse_from(["tether", "keygen"]).unwrap();
        assert!(matches!(cli.command, Commands::Keygen));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["tether"]).is_err());
        assert!(Cli::try_parse_from(["tether", "serve"]).is_err());
    }
}
