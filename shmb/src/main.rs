//! # SHMB Broker
//!
//! Per-machine owner of leased shared-memory segments.
//!
//! - `shmb serve` runs the broker in the foreground until `SHUTDOWN`,
//!   SIGINT or SIGTERM, then unlinks every remaining segment.
//! - `shmb ensure` starts a broker in the background unless one already
//!   answers on the control address.
//! - `shmb shutdown` asks the running broker to tear down and exit.
//!
//! Logs always go to stderr; with `--notify-ready` stdout carries exactly one
//! `READY <addr>` line once the listener is bound.

use clap::{Parser, Subcommand};
use shmb_common::config::BrokerConfig;
use shmb_common::consts::{BROKER_BIN_ENV, READY_LINE_PREFIX};
use shmb_shared_memory::{
    BrokerServer, ServiceConfig, ensure_running, shutdown_server, spawn_signal_listener,
};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// SHMB — shared-memory segment broker
#[derive(Parser, Debug)]
#[command(name = "shmb")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Leases named shared-memory segments to local processes")]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Path to broker configuration TOML.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control address; overrides config file and SHMB_ADDRESS.
    #[arg(long, global = true, value_name = "HOST:PORT")]
    address: Option<SocketAddr>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the broker in the foreground.
    Serve {
        /// Print `READY <addr>` on stdout once listening.
        #[arg(long)]
        notify_ready: bool,
    },
    /// Start a broker unless one is already running.
    Ensure {
        /// Broker executable to spawn (default: this executable).
        #[arg(long, value_name = "PATH")]
        broker_bin: Option<PathBuf>,

        /// Append the started broker's logs to this file (default: discard).
        #[arg(long, value_name = "FILE")]
        log_file: Option<PathBuf>,
    },
    /// Ask the running broker to shut down.
    Shutdown,
}

fn main() {
    let args = Args::parse();
    let config = BrokerConfig::resolve(args.config.as_deref());
    setup_tracing(&args, config.as_ref().ok());

    let result = match config {
        Ok(config) => run(&args, config),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn setup_tracing(args: &Args, config: Option<&BrokerConfig>) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        config
            .and_then(|c| c.shared.log_level.as_directive().parse().ok())
            .unwrap_or(Level::INFO)
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

fn run(args: &Args, mut config: BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(address) = args.address {
        config.address = address;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match &args.command {
        Cmd::Serve { notify_ready } => runtime.block_on(serve(&config, *notify_ready)),
        Cmd::Ensure {
            broker_bin,
            log_file,
        } => runtime.block_on(ensure(&config, broker_bin.clone(), log_file.clone())),
        Cmd::Shutdown => {
            runtime.block_on(shutdown_server(config.address))?;
            info!(address = %config.address, "shutdown requested");
            Ok(())
        }
    }
}

async fn serve(config: &BrokerConfig, notify_ready: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "{} v{} starting...",
        config.shared.service_name,
        env!("CARGO_PKG_VERSION")
    );

    let server = BrokerServer::bind(config.address).await?;
    let address = server.local_addr()?;
    let _signals = spawn_signal_listener(server.shutdown_handle())?;

    if notify_ready {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{READY_LINE_PREFIX} {address}")?;
        stdout.flush()?;
    }

    let report = server.serve().await?;
    info!(
        segments = report.segments,
        leases = report.leases,
        "{} shutdown complete",
        config.shared.service_name
    );
    Ok(())
}

async fn ensure(
    config: &BrokerConfig,
    broker_bin: Option<PathBuf>,
    log_file: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut service = ServiceConfig::from_broker_config(config);
    if let Some(path) = log_file {
        service = service.with_log_file(path);
    }
    match broker_bin {
        Some(bin) => service = service.with_broker_bin(bin),
        None if std::env::var_os(BROKER_BIN_ENV).is_none() => {
            service = service.with_broker_bin(std::env::current_exe()?);
        }
        None => {}
    }

    match ensure_running(&service).await? {
        Some(broker) => println!("started broker pid {} on {}", broker.pid, service.address),
        None => println!("broker already running on {}", service.address),
    }
    Ok(())
}
