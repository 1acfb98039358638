//! Polled snapshot feeds.
//!
//! Each feed runs at most one loop at a time. Every loop gets a fresh
//! epoch, announced to the reconciler via `FeedStarted`, and stamps
//! its responses with it; responses from a superseded or stopped loop
//! arrive with a stale epoch and are discarded by the reconciler.
//! One-shot fetches (manual refresh, disagreement re-fetch) carry
//! `ONE_SHOT_EPOCH` and always apply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::ApiClient;
use crate::reconciler::{Feed, ONE_SHOT_EPOCH, RefreshMode, SyncInput};

struct PollHandle {
    epoch: u64,
    cancel: CancellationToken,
}

/// Owns the poll loops and their epochs.
pub struct PollerSet {
    tx: mpsc::Sender<SyncInput>,
    api: Arc<ApiClient>,
    interval: Duration,
    cancel: CancellationToken,
    next_epoch: u64,
    handles: HashMap<Feed, PollHandle>,
}

impl PollerSet {
    pub fn new(
        tx: mpsc::Sender<SyncInput>,
        api: Arc<ApiClient>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            api,
            interval,
            cancel,
            next_epoch: 1,
            handles: HashMap::new(),
        }
    }

    pub fn is_running(&self, feed: &Feed) -> bool {
        self.handles.contains_key(feed)
    }

    /// Start (or restart) the loop for a feed. The first tick uses the
    /// given mode; subsequent ticks are silent so periodic refreshes
    /// never disturb the operator's scroll or focus.
    pub async fn start(&mut self, feed: Feed, mode: RefreshMode) {
        self.stop(&feed).await;

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let _ = self
            .tx
            .send(SyncInput::FeedStarted {
                feed: feed.clone(),
                epoch,
            })
            .await;

        let cancel = self.cancel.child_token();
        self.handles.insert(
            feed.clone(),
            PollHandle {
                epoch,
                cancel: cancel.clone(),
            },
        );

        let tx = self.tx.clone();
        let api = Arc::clone(&self.api);
        let interval = self.interval;
        info!(?feed, epoch, "poller: loop started");
        tokio::spawn(async move {
            let mut mode = mode;
            loop {
                let input = fetch(&api, &feed, epoch, mode).await;
                if tx.send(input).await.is_err() {
                    return;
                }
                mode = RefreshMode::Silent;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(?feed, epoch, "poller: loop cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Stop the loop for a feed, announcing the retirement of its
    /// epoch. No-op when the feed is not running.
    pub async fn stop(&mut self, feed: &Feed) {
        let Some(handle) = self.handles.remove(feed) else {
            return;
        };
        handle.cancel.cancel();
        info!(?feed, epoch = handle.epoch, "poller: loop stopped");
        let _ = self
            .tx
            .send(SyncInput::FeedStopped {
                feed: feed.clone(),
                epoch: handle.epoch,
            })
            .await;
    }

    /// Fire a single fetch outside any loop. Its result always
    /// applies, whatever loops started or stopped in the meantime.
    pub fn refresh_once(&self, feed: Feed, mode: RefreshMode) {
        let tx = self.tx.clone();
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let input = fetch(&api, &feed, ONE_SHOT_EPOCH, mode).await;
            let _ = tx.send(input).await;
        });
    }
}

async fn fetch(api: &ApiClient, feed: &Feed, epoch: u64, mode: RefreshMode) -> SyncInput {
    match feed {
        Feed::Overview => SyncInput::Snapshot {
            epoch,
            mode,
            outcome: api.fetch_overview().await.map_err(|e| e.to_string()),
        },
        Feed::Entity(entity_id) => SyncInput::Detail {
            entity_id: entity_id.clone(),
            epoch,
            mode,
            outcome: api.fetch_entity(entity_id).await.map_err(|e| e.to_string()),
        },
    }
}

/// Drains the reconciler's re-fetch requests into one-shot detail
/// fetches. Runs until the channel closes or cancellation.
pub async fn run_refetch_loop(
    mut refetch_rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::Sender<SyncInput>,
    api: Arc<ApiClient>,
    cancel: CancellationToken,
) {
    loop {
        let entity_id = tokio::select! {
            _ = cancel.cancelled() => return,
            entity_id = refetch_rx.recv() => match entity_id {
                Some(id) => id,
                None => return,
            },
        };
        debug!(entity_id, "poller: disagreement re-fetch");
        let input = fetch(
            &api,
            &Feed::Entity(entity_id),
            ONE_SHOT_EPOCH,
            RefreshMode::Silent,
        )
        .await;
        if tx.send(input).await.is_err() {
            return;
        }
    }
}
