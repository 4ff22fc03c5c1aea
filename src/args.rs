use std::path::PathBuf;

use clap::Parser;

/// Periodically samples the most-watched live channels and records how their chat audiences overlap.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Run a single collection cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Keep results in memory instead of writing them to postgres
    #[arg(long)]
    pub dry_run: bool,

    /// Additional dotenv file loaded after `.env`
    #[arg(short, long)]
    pub env_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

pub fn parse_cli_args() -> Cli {
    Cli::parse()
}
