//! Wiring: channels, shared state, and background task startup.
//!
//! `start` builds the whole sync pipeline: the reconciler (single
//! writer), the push-stream client, and the disagreement re-fetch
//! loop, all joined by channels and one cancellation token. The
//! caller gets back the handles a front end needs: the shared view,
//! the input sender, a notification subscription point, and the
//! poller set (feeds are started by the front end, which knows which
//! screens are visible).

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::ApiClient;
use crate::overrides::OverrideStore;
use crate::reconciler::{DashboardView, Reconciler, SharedView, SyncInput};
use crate::render::RenderRequest;
use crate::sources::poller::{PollerSet, run_refetch_loop};
use crate::sources::stream::{BackoffPolicy, StreamSupervisor};

const INPUT_CHANNEL_CAPACITY: usize = 256;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

pub struct PipelineConfig {
    pub api_url: String,
    pub stream_url: String,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub buffer_capacity: usize,
    pub backoff: BackoffPolicy,
}

/// Handles for a running pipeline.
pub struct Pipeline {
    pub shared: SharedView,
    pub input_tx: mpsc::Sender<SyncInput>,
    pub notify_tx: broadcast::Sender<RenderRequest>,
    pub poller: PollerSet,
    pub stream: StreamSupervisor,
    pub api: Arc<ApiClient>,
    pub cancel: CancellationToken,
}

/// Build and spawn the pipeline's background tasks.
pub fn start(config: PipelineConfig) -> anyhow::Result<Pipeline> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let overrides = OverrideStore::open(&config.db_path)
        .with_context(|| format!("opening override store at {}", config.db_path.display()))?;

    let api = Arc::new(ApiClient::new(config.api_url.clone()).context("building HTTP client")?);
    let cancel = CancellationToken::new();

    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    let (notify_tx, _notify_rx) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
    let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();

    let shared: SharedView = Arc::new(RwLock::new(DashboardView::default()));

    let mut reconciler = Reconciler::new(
        input_rx,
        notify_tx.clone(),
        refetch_tx,
        Arc::clone(&shared),
        overrides,
        config.buffer_capacity,
        cancel.clone(),
    );
    tokio::spawn(async move {
        reconciler.run().await;
    });

    let mut stream = StreamSupervisor::new(
        input_tx.clone(),
        config.stream_url.clone(),
        config.backoff,
        cancel.clone(),
    );
    stream.start();

    tokio::spawn(run_refetch_loop(
        refetch_rx,
        input_tx.clone(),
        Arc::clone(&api),
        cancel.clone(),
    ));

    let poller = PollerSet::new(
        input_tx.clone(),
        Arc::clone(&api),
        config.poll_interval,
        cancel.clone(),
    );

    info!(
        api_url = %config.api_url,
        stream_url = %config.stream_url,
        db = %config.db_path.display(),
        "sync pipeline started"
    );

    Ok(Pipeline {
        shared,
        input_tx,
        notify_tx,
        poller,
        stream,
        api,
        cancel,
    })
}
