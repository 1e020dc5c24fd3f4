//! veho-daemon: the standalone routing host.
//!
//! One long-running process per machine owns the external sockets and the
//! local bus; applications attach as proxies. The daemon offers no
//! services of its own.
//!
//! Signals: SIGINT/SIGTERM shut down gracefully, SIGUSR1 suspends routing,
//! SIGUSR2 resumes it.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use veho_config::Config;
use veho_routing::{HostOptions, RoutingHost};
use veho_types::RoutingState;

#[derive(Parser, Debug)]
#[command(name = "veho-daemon", about = "SOME/IP routing host daemon", version)]
struct Args {
    /// Detach from the controlling terminal.
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Suppress diagnostic log forwarding.
    #[arg(short = 'q', long)]
    quiet: bool,
}

/// Marker so the re-executed daemon child does not fork again.
const DAEMONIZED_ENV: &str = "VEHO_DAEMONIZED";

fn main() -> ExitCode {
    let args = Args::parse();

    if args.daemonize && std::env::var_os(DAEMONIZED_ENV).is_none() {
        return detach();
    }

    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config, args.quiet);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("cannot start runtime: {error}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "daemon failed");
            ExitCode::from(1)
        }
    }
}

async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "routing host starting");

    let host = RoutingHost::start(config, HostOptions::default())
        .await
        .map_err(|error| anyhow::anyhow!("failed to acquire the routing role: {error}"))?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination requested, shutting down");
                break;
            }
            _ = sigusr1.recv() => {
                info!("suspend requested");
                host.set_routing_state(RoutingState::Suspended).await?;
            }
            _ = sigusr2.recv() => {
                info!("resume requested");
                host.set_routing_state(RoutingState::Resumed).await?;
                host.set_routing_state(RoutingState::Running).await?;
            }
        }
    }

    host.stop();
    info!("routing host stopped");
    Ok(())
}

fn init_tracing(config: &Config, quiet: bool) {
    let level = if quiet {
        "error".to_string()
    } else {
        match config.logging.level.as_str() {
            "fatal" => "error".to_string(),
            "warning" => "warn".to_string(),
            other => other.to_string(),
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("veho={level}"))),
        )
        .init();
}

/// Re-execute ourselves detached from the terminal; the parent exits.
fn detach() -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            eprintln!("cannot resolve executable for daemonize: {error}");
            return ExitCode::from(1);
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    match std::process::Command::new(exe)
        .args(&args)
        .env(DAEMONIZED_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => {
            println!("daemon started with pid {}", child.id());
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("daemonize failed: {error}");
            ExitCode::from(1)
        }
    }
}
