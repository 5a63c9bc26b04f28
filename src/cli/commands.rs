//! CLI command definitions for lyrebird.
//!
//! - `serve`: run the job source over a job-stream file
//! - `connect`: run a dispatcher with a local worker pool
//! - `worker`: hidden subprocess entry point used by `connect`

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};

use crate::config::{ClientConfig, ServerConfig, DEFAULT_MAX_CLIENTS};
use crate::decrypt::TweetCipher;
use crate::dispatcher::{parse_endpoint, Dispatcher};
use crate::logging::{self, LogTarget};
use crate::protocol::MAX_MESSAGE_LEN;
use crate::scheduler::queue::JobStream;
use crate::scheduler::worker_pool::ProcessLauncher;
use crate::source::JobSource;
use crate::worker::Worker;

/// Distributed tweet decryption over a job source, dispatchers and workers.
#[derive(Parser)]
#[command(name = "lyrebird")]
#[command(about = "Distribute tweet decryption jobs across dispatchers and their worker pools")]
#[command(version)]
#[command(
    long_about = "lyrebird streams decryption jobs from a job source to connected dispatchers.\n\nEach dispatcher runs a local worker pool and schedules jobs first-come-first-served.\n\nExample usage:\n  lyrebird serve config.txt lyrebird.log\n  lyrebird connect 192.168.1.20 45001"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Serve the jobs listed in a job-stream file to connected dispatchers.
    Serve(ServeArgs),

    /// Connect to a job source and decrypt the jobs it hands out.
    #[command(alias = "client")]
    Connect(ConnectArgs),

    /// Run a single worker on stdin/stdout.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for `lyrebird serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Job-stream file: one "<input> <output>" record per line.
    pub config: PathBuf,

    /// Log file, appended to.
    pub log: PathBuf,

    /// Address to listen on (default: a non-loopback address of this host).
    #[arg(long, env = "LYREBIRD_BIND")]
    pub bind: Option<IpAddr>,

    /// Port to listen on (0 picks a free port).
    #[arg(short, long, default_value = "0", env = "LYREBIRD_PORT")]
    pub port: u16,

    /// Maximum number of connected dispatchers.
    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS, env = "LYREBIRD_MAX_CLIENTS")]
    pub max_clients: usize,

    /// Bounded wait of the polling loop, in milliseconds.
    #[arg(long, default_value = "1")]
    pub poll_interval_ms: u64,

    /// Print the run report as JSON on exit.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `lyrebird connect`.
#[derive(Parser, Debug)]
pub struct ConnectArgs {
    /// IP address of the job source.
    pub address: String,

    /// Port of the job source.
    pub port: String,

    /// Number of workers (default: one per spare core).
    #[arg(short, long, env = "LYREBIRD_WORKERS")]
    pub workers: Option<usize>,

    /// Bounded wait of the polling loop, in milliseconds.
    #[arg(long, default_value = "1")]
    pub poll_interval_ms: u64,

    /// Print the run report as JSON on exit.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for the hidden `lyrebird worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Maximum frame length of result messages.
    #[arg(long, default_value_t = MAX_MESSAGE_LEN)]
    pub max_message_len: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Each command installs its own logging, since the job source also logs to
/// a file and subprocess workers log to stderr.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args, &cli.log_level).await,
        Commands::Connect(args) => run_connect_command(args, &cli.log_level).await,
        Commands::Worker(args) => run_worker_command(args, &cli.log_level).await,
    }
}

async fn run_serve_command(args: ServeArgs, log_level: &str) -> anyhow::Result<ExitCode> {
    let log_file = match logging::open_log_file(&args.log) {
        Ok(file) => file,
        Err(e) => {
            logging::init(log_level, None, LogTarget::Stdout)?;
            error!(path = %args.log.display(), error = %e, "Unable to open log file");
            return Ok(ExitCode::FAILURE);
        }
    };
    logging::init(log_level, Some(log_file), LogTarget::Stdout)?;

    let jobs = match JobStream::open(&args.config).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "Unable to open job stream");
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut config = ServerConfig::new()
        .with_port(args.port)
        .with_max_clients(args.max_clients)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }

    let source = match JobSource::bind(config, jobs).await {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "Unable to start server");
            return Ok(ExitCode::FAILURE);
        }
    };

    let pid = std::process::id();
    let addr = source.local_addr()?;
    info!(
        pid,
        host = %addr.ip(),
        port = addr.port(),
        "Lyrebird server: PID {} on host {}, port {}",
        pid,
        addr.ip(),
        addr.port()
    );

    let report = source.run().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    info!(pid, "Lyrebird server: PID {} completed its tasks and is exiting", pid);
    Ok(exit_code(report.is_success()))
}

async fn run_connect_command(args: ConnectArgs, log_level: &str) -> anyhow::Result<ExitCode> {
    logging::init(log_level, None, LogTarget::Stdout)?;

    let server = match parse_endpoint(&args.address, &args.port) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Invalid server endpoint");
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut config =
        ClientConfig::new().with_poll_interval(Duration::from_millis(args.poll_interval_ms));
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }

    let launcher = ProcessLauncher::current_exe(log_level, config.max_message_len)?;
    let dispatcher = match Dispatcher::connect(server, config, &launcher).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, "Unable to start client");
            return Ok(ExitCode::FAILURE);
        }
    };

    let report = dispatcher.run().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(exit_code(report.is_success()))
}

async fn run_worker_command(args: WorkerArgs, log_level: &str) -> anyhow::Result<ExitCode> {
    logging::init(log_level, None, LogTarget::Stderr)?;

    let worker = Worker::new(std::process::id().to_string(), Arc::new(TweetCipher::new()))
        .with_max_message_len(args.max_message_len);
    let exit = worker
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;

    Ok(exit_code(exit.is_success()))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
