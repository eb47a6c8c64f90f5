//! # CLI Interface
//!
//! Defines the command-line argument structure for `mintbridge-node` using
//! `clap` derive. Subcommands: `run`, `dead-letters`, and `version`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Mintbridge settlement service.
///
/// Accepts signed mint intents, escrows the deposit, and settles them into
/// destination assets when a signed settlement notification arrives.
#[derive(Parser, Debug)]
#[command(
    name = "mintbridge-node",
    about = "Compliance-gated mint escrow settlement service",
    version,
    propagate_version = true
)]
pub struct MintbridgeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP service.
    Run(RunArgs),
    /// Inspect or prune the dead letter queue.
    #[command(subcommand)]
    DeadLetters(DeadLetterCommand),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c', env = "MINTBRIDGE_CONFIG")]
    pub config: PathBuf,

    /// Directory holding the idempotency records and the dead letter queue.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "MINTBRIDGE_DATA_DIR", default_value = "./mintbridge-data")]
    pub data_dir: PathBuf,

    /// Port for the REST API. Overrides `service.http_port`.
    #[arg(long, env = "MINTBRIDGE_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint. Overrides
    /// `service.metrics_port`.
    #[arg(long, env = "MINTBRIDGE_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Log output format.
    #[arg(long, env = "MINTBRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// `dead-letters` subcommands. Both operate directly on the data directory,
/// so run them while the service is stopped.
#[derive(Subcommand, Debug)]
pub enum DeadLetterCommand {
    /// Print entries oldest first as JSON lines.
    List(ListArgs),
    /// Delete one entry after manual remediation.
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, short = 'd', env = "MINTBRIDGE_DATA_DIR", default_value = "./mintbridge-data")]
    pub data_dir: PathBuf,

    /// Only entries for this payment reference.
    #[arg(long)]
    pub reference: Option<String>,

    /// Maximum number of entries to print.
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[arg(long, short = 'd', env = "MINTBRIDGE_DATA_DIR", default_value = "./mintbridge-data")]
    pub data_dir: PathBuf,

    /// Entry id as printed by `dead-letters list`.
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        MintbridgeCli::command().debug_assert();
    }

    #[test]
    fn run_flags_override_config() {
        let cli = MintbridgeCli::try_parse_from([
            "mintbridge-node",
            "run",
            "--config",
            "bridge.json",
            "--http-port",
            "8080",
            "--log-format",
            "json",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.http_port, Some(8080));
        assert_eq!(args.metrics_port, None);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn dead_letter_list_parses_filters() {
        let cli = MintbridgeCli::try_parse_from([
            "mintbridge-node",
            "dead-letters",
            "list",
            "--reference",
            "MP-77",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::DeadLetters(DeadLetterCommand::List(args)) => {
                assert_eq!(args.reference.as_deref(), Some("MP-77"));
                assert_eq!(args.limit, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
