use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LoggingSettings, RatekeeperConfig};
use ratekeeper::{Algorithm, Decision, RateLimiter};

/// Rate limiting decision engine.
#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// YAML configuration file, overridden by RATEKEEPER__* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate identifiers against a local limiter and print one decision per line
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Identifiers to check; read from stdin, one per line, when omitted
    ids: Vec<String>,

    /// Admission algorithm (fixed-window, sliding-window, token-bucket)
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Window length in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Requests admitted per window
    #[arg(long)]
    max_requests: Option<u64>,

    /// Count requests without denying them
    #[arg(long)]
    draft: bool,
}

#[derive(Serialize)]
struct CheckOutput<'a> {
    id: &'a str,
    #[serde(flatten)]
    decision: &'a Decision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RatekeeperConfig::load(cli.config.as_deref())?;
    if cli.json_logs {
        config.logging.json = true;
    }
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check(args) => run_check(config, args).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Decisions go to stdout, so logs stay on stderr
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run_check(mut config: RatekeeperConfig, args: CheckArgs) -> anyhow::Result<()> {
    if let Some(algorithm) = args.algorithm {
        config.limiter.algorithm = algorithm;
    }
    if let Some(window_ms) = args.window_ms {
        config.limiter.window_ms = window_ms;
    }
    if let Some(max_requests) = args.max_requests {
        config.limiter.max_requests = max_requests;
    }
    if args.draft {
        config.limiter.draft_mode = true;
    }
    config.validate()?;

    let limiter = Arc::new(config.build_limiter()?);

    if args.ids.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(id) => print_decision(&limiter, id.trim()).await?,
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
    } else {
        for id in &args.ids {
            print_decision(&limiter, id).await?;
        }
    }

    limiter.dispose().await;
    Ok(())
}

async fn print_decision(limiter: &RateLimiter, id: &str) -> anyhow::Result<()> {
    let decision = limiter.check(id).await?;
    let line = serde_json::to_string(&CheckOutput {
        id,
        decision: &decision,
    })?;
    println!("{}", line);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
