use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use steward::api::ApiClient;
use steward::overrides::OverrideStore;
use steward::pipeline::{self, PipelineConfig};
use steward::reconciler::{Feed, RefreshMode};
use steward::sources::stream::BackoffPolicy;
use steward::status::format_status;
use steward::tui::{TuiHandles, run_tui};

const DEFAULT_API_URL: &str = "http://127.0.0.1:8787";
const DEFAULT_STREAM_URL: &str = "ws://127.0.0.1:8787/api/events";
const DEFAULT_DB_PATH: &str = "/tmp/steward/overrides.db";

#[derive(Parser)]
#[command(name = "steward", about = "Live operator dashboard for the task lifecycle")]
struct Cli {
    /// Backend HTTP base URL
    #[arg(long, env = "STEWARD_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Event stream WebSocket URL
    #[arg(long, env = "STEWARD_STREAM_URL", default_value = DEFAULT_STREAM_URL)]
    stream_url: String,

    /// Path to the local override database
    #[arg(long, env = "STEWARD_DB", default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Snapshot polling interval in milliseconds
    #[arg(long, default_value_t = 5000)]
    poll_interval_ms: u64,

    /// Event ticker capacity
    #[arg(long, default_value_t = 150)]
    buffer_capacity: usize,

    /// Give up reconnecting the stream after this many consecutive
    /// disconnections
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive dashboard (default when no subcommand given)
    Tui,
    /// One-shot status overview
    Status,
    /// Headless mode: log view summaries as updates arrive
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing. Respects RUST_LOG env var, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Tui) => run_dashboard(&cli).await,
        Some(Commands::Status) => run_status(&cli).await,
        Some(Commands::Watch) => run_watch(&cli).await,
    }
}

fn pipeline_config(cli: &Cli) -> PipelineConfig {
    PipelineConfig {
        api_url: cli.api_url.clone(),
        stream_url: cli.stream_url.clone(),
        db_path: cli.db.clone(),
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        buffer_capacity: cli.buffer_capacity,
        backoff: BackoffPolicy {
            max_retries: cli.max_retries,
            ..BackoffPolicy::default()
        },
    }
}

async fn run_dashboard(cli: &Cli) -> anyhow::Result<()> {
    let pipeline = pipeline::start(pipeline_config(cli))?;
    let notify_rx = pipeline.notify_tx.subscribe();

    let result = run_tui(TuiHandles {
        shared: pipeline.shared,
        notify_rx,
        input_tx: pipeline.input_tx,
        poller: pipeline.poller,
        stream: pipeline.stream,
        api: pipeline.api,
    })
    .await;

    pipeline.cancel.cancel();
    result
}

/// Fetch one overview, merge the persisted overrides, and print.
async fn run_status(cli: &Cli) -> anyhow::Result<()> {
    let api = ApiClient::new(cli.api_url.clone())?;
    let snapshot = api.fetch_overview().await.map_err(|e| {
        eprintln!("Failed to fetch overview from {}: {}", cli.api_url, e);
        e
    })?;

    // A missing or broken override store degrades to "no overrides".
    let overrides: HashMap<String, String> = match OverrideStore::open(&cli.db) {
        Ok(store) => store
            .load_all()
            .unwrap_or_default()
            .into_iter()
            .collect(),
        Err(e) => {
            tracing::warn!(db = %cli.db.display(), "override store unavailable: {e}");
            HashMap::new()
        }
    };

    print!("{}", format_status(&snapshot, &overrides));
    Ok(())
}

/// Headless mode: run the pipeline and log a one-line summary on
/// every view update until ctrl-c.
async fn run_watch(cli: &Cli) -> anyhow::Result<()> {
    let pipeline = pipeline::start(pipeline_config(cli))?;
    let mut notify_rx = pipeline.notify_tx.subscribe();
    let mut poller = pipeline.poller;
    poller.start(Feed::Overview, RefreshMode::Normal).await;

    loop {
        tokio::select! {
            request = notify_rx.recv() => {
                match request {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Ok(view) = pipeline.shared.read() {
                            tracing::info!(
                                connection = view.connection.label(),
                                entities = view.entities.len(),
                                events = view.ticker.len(),
                                stage_counts = ?view.stage_counts,
                                error = view.overview_error.as_deref().unwrap_or(""),
                                "view updated"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
        }
    }

    pipeline.cancel.cancel();
    Ok(())
}
