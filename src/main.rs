//! `aesdsocket` binary.
//!
//! Listens on port 9000 by default; `-d` detaches after the socket is bound.

use aesd_socket::{logging, process, Config, Error, ErrorCode, Result, Service};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "aesdsocket", version)]
#[command(about = "Concurrent line-oriented logging socket service", long_about = None)]
struct Cli {
    /// Run as a daemon once the listening socket is bound
    #[arg(short, long)]
    daemon: bool,

    /// Config file path
    #[arg(short, long, default_value = aesd_socket::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, code = %e.code(), "Fatal error");
            eprintln!("aesdsocket: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = Config::load_from_file(&cli.config)?;

    // The working directory becomes `/` once detached.
    if let Some(pid_file) = config.pid_file.take() {
        config.pid_file = Some(absolute(pid_file)?);
    }

    logging::init(&config.logging)?;
    info!(version = aesd_socket::VERSION, daemon = cli.daemon, "Starting aesdsocket");

    let service = Service::builder(config).bind()?;

    if cli.daemon {
        process::daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("aesdsocket-worker")
        .build()
        .map_err(|e| {
            Error::runtime_with_source(ErrorCode::RuntimeStart, "Failed to build async runtime", e)
        })?;

    let stats = runtime.block_on(service.run())?;
    info!(accepted = stats.accepted, "Exiting");
    Ok(())
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| Error::io_with_source("Failed to read working directory", e))?;
    Ok(cwd.join(path))
}
