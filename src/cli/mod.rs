//! Command-line interface for lyrebird.
//!
//! Provides the job source (`serve`), dispatcher (`connect`) and subprocess
//! worker entry points.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
