//! `ldapcache` command-line entry point.
//!
//! ```text
//! ldapcache run [--feed changes.jsonl]      consume until SIGINT/SIGTERM
//! ldapcache rebuild snapshot.jsonl          recreate from a snapshot
//! ldapcache stats                           print environment usage
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ldapcache_events::{JsonLinesSource, LineFeed};
use ldapcache_listener::{
    init_tracing, rebuild_from, run, stats, ListenerConfig, ListenerError, ListenerResult,
    TelemetryConfig,
};
use tokio::io::BufReader;
use tokio::sync::watch;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Directory group-membership cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Environment directory
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Maximum environment size in megabytes
    #[arg(long, global = true)]
    max_size_mb: Option<usize>,

    /// TOML cache layout (built-in layout when omitted)
    #[arg(long, global = true)]
    layout: Option<PathBuf>,

    /// Messages between cleanup passes
    #[arg(long, global = true)]
    cleanup_interval: Option<u64>,

    /// Output logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the change feed until interrupted
    Run {
        /// JSON-lines change file; stdin when omitted
        #[arg(long)]
        feed: Option<PathBuf>,
    },
    /// Discard all cached data and replay a directory snapshot
    Rebuild {
        /// JSON-lines snapshot, one object per line
        snapshot: PathBuf,
    },
    /// Print map size, disk usage and entries per sub-database as JSON
    Stats,
}

impl Cli {
    fn config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::from_env();
        if let Some(path) = &self.path {
            config.storage.path = path.clone();
        }
        if let Some(max_size_mb) = self.max_size_mb {
            config.storage.max_size_mb = max_size_mb;
        }
        if let Some(layout) = &self.layout {
            config.layout_path = Some(layout.clone());
        }
        if let Some(interval) = self.cleanup_interval {
            config.consumer.cleanup_interval = interval;
        }
        config
    }

    fn telemetry(&self) -> TelemetryConfig {
        let mut telemetry = TelemetryConfig::from_env();
        telemetry.json |= self.log_json;
        telemetry
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.telemetry()) {
        eprintln!("ldapcache: {}", e);
        return ExitCode::FAILURE;
    }

    match execute(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "ldapcache failed");
            eprintln!("ldapcache: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: &Cli) -> ListenerResult<()> {
    let config = cli.config();

    match &cli.command {
        Command::Run { feed } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            });

            let snapshot = match feed {
                Some(path) => {
                    let file = tokio::fs::File::open(path).await.map_err(|source| {
                        ListenerError::Io {
                            path: path.display().to_string(),
                            source,
                        }
                    })?;
                    run(&config, LineFeed::new(BufReader::new(file)), shutdown_rx).await?
                }
                None => {
                    let stdin = tokio::io::stdin();
                    run(&config, LineFeed::new(BufReader::new(stdin)), shutdown_rx).await?
                }
            };
            tracing::info!(
                applied = snapshot.applied,
                skipped = snapshot.skipped,
                malformed = snapshot.malformed,
                "Listener stopped"
            );
        }
        Command::Rebuild { snapshot } => {
            let file = tokio::fs::File::open(snapshot)
                .await
                .map_err(|source| ListenerError::Io {
                    path: snapshot.display().to_string(),
                    source,
                })?;
            let mut source = JsonLinesSource::new(BufReader::new(file));
            let report = rebuild_from(&config, &mut source).await?;
            println!(
                "rebuilt {} objects: {} records stored, {} skipped, {} unreadable",
                report.objects, report.stored, report.skipped, report.malformed
            );
        }
        Command::Stats => {
            let stats = stats(&config)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
