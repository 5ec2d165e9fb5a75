use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidewin::config::{Format, SlidewinConfig};
use slidewin::replay::{Mode, Replayer};

/// Replay `<timestamp> <entity>` request lines through a sliding window limiter.
#[derive(Debug, Parser)]
#[command(name = "slidewin", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Window length in seconds (overrides configuration)
    #[arg(short, long)]
    window: Option<u64>,

    /// Maximum requests per window (overrides configuration)
    #[arg(short = 'n', long)]
    capacity: Option<usize>,

    /// Record every request, not just admitted ones
    #[arg(long)]
    record_all: bool,

    /// Decision output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Log format (overrides configuration)
    #[arg(long, value_enum)]
    log_format: Option<Format>,

    /// Input file; reads stdin when omitted
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SlidewinConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(window) = cli.window {
        config.limiter.window_secs = window;
    }
    if let Some(capacity) = cli.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(log_format) = cli.log_format {
        config.logging.format = log_format;
    }

    init_tracing(config.logging.format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        window_secs = config.limiter.window_secs,
        capacity = config.limiter.capacity,
        "Configuration loaded"
    );

    let limiter = Arc::new(config.limiter.build::<String>()?);
    let mode = if cli.record_all {
        Mode::RecordAll
    } else {
        Mode::Acquire
    };
    let replayer = Replayer::new(limiter, mode, cli.format);

    let reader: Box<dyn AsyncBufRead + Unpin> = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut stdout = tokio::io::stdout();
    let summary = replayer
        .run(reader, &mut stdout, shutdown_signal())
        .await?;

    info!(
        allowed = summary.allowed,
        denied = summary.denied,
        rejected = summary.rejected,
        skipped = summary.skipped,
        entities = summary.entities,
        "Replay finished"
    );

    Ok(())
}

/// Install the global subscriber. Logs go to stderr; stdout carries decisions.
fn init_tracing(format: Format) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        Format::Text => builder.init(),
        Format::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping replay");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping replay");
        }
    }
}
