//! lyrebird CLI entry point.
//!
//! Parses arguments and delegates to the CLI module, which installs logging
//! for the selected tier.

use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = lyrebird::cli::parse_cli();
    lyrebird::cli::run_with_cli(cli).await
}
