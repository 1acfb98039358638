//! The reconciler: single writer for all synchronized state.
//!
//! Merges stream events, polled snapshots, and local overrides into
//! the canonical per-entity view-model, keeps the shared read state in
//! sync, and notifies the rendering layer after every mutation in the
//! same turn. All mutation funnels through `handle`; sources only send
//! `SyncInput`s over the channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_core::buffer::EventBuffer;
use steward_core::projection::project;
use steward_core::timeline::normalize_timeline;
use steward_core::types::{ConnectionState, Event, Stage, StageSource, StageState};

use crate::api::{EntityDetail, OverviewSnapshot};
use crate::overrides::OverrideStore;
use crate::render::{Region, RenderRequest};

/// Epoch value for one-shot fetches that are not tied to a running
/// poll loop (manual refresh, disagreement re-fetch). Always applied.
pub const ONE_SHOT_EPOCH: u64 = u64::MAX;

/// How the caller that triggered a refresh expects it to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Full view rebuild afterwards.
    Normal,
    /// Patch only the affected regions; used while the operator is
    /// scrolling or typing elsewhere in the view.
    Silent,
}

/// A logical polled feed. Each feed has at most one running loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Feed {
    Overview,
    Entity(String),
}

/// Everything that can mutate synchronized state.
#[derive(Debug)]
pub enum SyncInput {
    /// One event delivered over the push stream, in arrival order.
    StreamEvent(Event),
    /// Push-stream connection state transition.
    Connection(ConnectionState),
    /// A poll loop (re)started; responses carrying older epochs for
    /// the same feed are stale and must be discarded.
    FeedStarted { feed: Feed, epoch: u64 },
    FeedStopped { feed: Feed, epoch: u64 },
    /// Result of one overview poll tick.
    Snapshot {
        epoch: u64,
        mode: RefreshMode,
        outcome: Result<OverviewSnapshot, String>,
    },
    /// Result of one entity-detail fetch.
    Detail {
        entity_id: String,
        epoch: u64,
        mode: RefreshMode,
        outcome: Result<EntityDetail, String>,
    },
    /// Explicit user action: set a durable status override.
    SetOverride { entity_id: String, status: String },
    /// Explicit user action: clear the override.
    ClearOverride { entity_id: String },
    /// Transient, dismissible operator notification.
    Notice(String),
    DismissNotice,
}

/// Per-entity derived view handed to rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub entity_id: String,
    /// `override ?? authoritative`, re-derived on every view sync.
    pub effective_status: Option<String>,
    pub authoritative_status: Option<String>,
    pub override_status: Option<String>,
    pub service: Option<String>,
    pub stage_state: StageState,
    pub stage_source: StageSource,
    /// Projection ran ahead of the authoritative timeline; a re-fetch
    /// is in flight.
    pub timeline_stale: bool,
}

/// Canonical view-model consumed by the rendering layer.
#[derive(Debug, Clone)]
pub struct DashboardView {
    pub connection: ConnectionState,
    /// False until the first successful overview snapshot, and again
    /// after a failed fetch clears the feed's displayed items.
    pub overview_loaded: bool,
    pub overview_error: Option<String>,
    pub detail_errors: HashMap<String, String>,
    pub notice: Option<String>,
    /// Indexed by `Stage::index()`: last snapshot counts plus stream
    /// increments observed since.
    pub stage_counts: [u64; 4],
    pub ticker: Vec<Event>,
    pub entities: Vec<EntityView>,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            overview_loaded: false,
            overview_error: None,
            detail_errors: HashMap::new(),
            notice: None,
            stage_counts: [0; 4],
            ticker: Vec::new(),
            entities: Vec::new(),
        }
    }
}

/// Shared read state: written by the reconciler, read by rendering.
pub type SharedView = Arc<RwLock<DashboardView>>;

#[derive(Debug, Default)]
struct EntityRecord {
    authoritative_status: Option<String>,
    service: Option<String>,
    /// Normalized authoritative timeline, when loaded. Takes
    /// precedence over the client projection for display.
    timeline: Option<StageState>,
    timeline_stale: bool,
}

pub struct Reconciler {
    rx: mpsc::Receiver<SyncInput>,
    notify_tx: broadcast::Sender<RenderRequest>,
    /// Entities whose authoritative timeline should be re-fetched.
    refetch_tx: mpsc::UnboundedSender<String>,
    shared: SharedView,
    overrides: OverrideStore,
    cancel: CancellationToken,

    entities: HashMap<String, EntityRecord>,
    /// Merged event set per entity (snapshot ∪ stream), deduplicated
    /// globally by event id.
    events: HashMap<String, Vec<Event>>,
    seen_event_ids: HashSet<String>,
    buffer: EventBuffer,
    /// Stage counts from the last snapshot, plus live increments.
    base_counts: [u64; 4],
    live_counts: [u64; 4],
    connection: ConnectionState,
    overview_loaded: bool,
    overview_error: Option<String>,
    detail_errors: HashMap<String, String>,
    notice: Option<String>,
    active_feeds: HashMap<Feed, u64>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<SyncInput>,
        notify_tx: broadcast::Sender<RenderRequest>,
        refetch_tx: mpsc::UnboundedSender<String>,
        shared: SharedView,
        overrides: OverrideStore,
        buffer_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            notify_tx,
            refetch_tx,
            shared,
            overrides,
            cancel,
            entities: HashMap::new(),
            events: HashMap::new(),
            seen_event_ids: HashSet::new(),
            buffer: EventBuffer::new(buffer_capacity),
            base_counts: [0; 4],
            live_counts: [0; 4],
            connection: ConnectionState::Disconnected,
            overview_loaded: false,
            overview_error: None,
            detail_errors: HashMap::new(),
            notice: None,
            active_feeds: HashMap::new(),
        }
    }

    /// Main event loop. Runs until the input channel closes or the
    /// cancellation token fires.
    pub async fn run(&mut self) {
        info!("reconciler: event loop started");
        loop {
            tokio::select! {
                input = self.rx.recv() => {
                    match input {
                        Some(input) => self.handle(input),
                        None => {
                            info!("reconciler: input channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("reconciler: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    /// Apply one input. Synchronous: every mutation is followed by a
    /// shared-view sync and a render notification before the next
    /// input is dispatched.
    pub fn handle(&mut self, input: SyncInput) {
        match input {
            SyncInput::StreamEvent(event) => self.handle_stream_event(event),
            SyncInput::Connection(state) => {
                debug!(state = state.label(), "connection state changed");
                self.connection = state;
                self.publish(&[RenderRequest::Patch(Region::Header)]);
            }
            SyncInput::FeedStarted { feed, epoch } => {
                self.active_feeds.insert(feed, epoch);
            }
            SyncInput::FeedStopped { feed, epoch } => {
                if self.active_feeds.get(&feed) == Some(&epoch) {
                    self.active_feeds.remove(&feed);
                }
            }
            SyncInput::Snapshot { epoch, mode, outcome } => {
                if !self.feed_active(&Feed::Overview, epoch) {
                    debug!(epoch, "dropping stale overview snapshot");
                    return;
                }
                self.handle_snapshot(mode, outcome);
            }
            SyncInput::Detail { entity_id, epoch, mode, outcome } => {
                let feed = Feed::Entity(entity_id.clone());
                if !self.feed_active(&feed, epoch) {
                    debug!(entity_id, epoch, "dropping stale detail response");
                    return;
                }
                self.handle_detail(entity_id, mode, outcome);
            }
            SyncInput::SetOverride { entity_id, status } => {
                self.ensure_entity(&entity_id);
                if let Err(e) = self.overrides.set(&entity_id, &status) {
                    warn!(entity_id, "override write failed: {e}");
                    self.notice = Some(format!("override write failed for {entity_id}"));
                }
                self.publish(&[
                    RenderRequest::Patch(Region::EntityTable),
                    RenderRequest::Patch(Region::Detail),
                ]);
            }
            SyncInput::ClearOverride { entity_id } => {
                if let Err(e) = self.overrides.clear(&entity_id) {
                    warn!(entity_id, "override clear failed: {e}");
                    self.notice = Some(format!("override clear failed for {entity_id}"));
                }
                self.publish(&[
                    RenderRequest::Patch(Region::EntityTable),
                    RenderRequest::Patch(Region::Detail),
                ]);
            }
            SyncInput::Notice(text) => {
                self.notice = Some(text);
                self.publish(&[RenderRequest::Patch(Region::Header)]);
            }
            SyncInput::DismissNotice => {
                self.notice = None;
                self.publish(&[RenderRequest::Patch(Region::Header)]);
            }
        }
    }

    fn feed_active(&self, feed: &Feed, epoch: u64) -> bool {
        epoch == ONE_SHOT_EPOCH || self.active_feeds.get(feed) == Some(&epoch)
    }

    fn handle_stream_event(&mut self, event: Event) {
        if !self.seen_event_ids.insert(event.id.clone()) {
            debug!(id = %event.id, "duplicate stream event discarded");
            return;
        }

        if let Some(stage) = event.stage {
            self.live_counts[stage.index()] += 1;
        }
        self.buffer.push(event.clone());

        let mut requests = vec![
            RenderRequest::Patch(Region::Ticker),
            RenderRequest::Patch(Region::StageCounters),
        ];

        if let Some(entity_id) = event.entity_id.clone() {
            let created = self.ensure_entity(&entity_id);
            self.events
                .entry(entity_id.clone())
                .or_default()
                .push(event);
            self.check_timeline_disagreement(&entity_id);

            if created {
                // The entity table changed shape; a patch cannot add
                // a row.
                requests = vec![RenderRequest::Rebuild];
            } else {
                requests.push(RenderRequest::Patch(Region::EntityTable));
            }
        }

        self.publish(&requests);
    }

    /// Authoritative-vs-projected resolution: authoritative wins for
    /// display whenever loaded, but if the projection over the merged
    /// event set has run ahead of it, mark the timeline stale and ask
    /// for an immediate re-fetch.
    fn check_timeline_disagreement(&mut self, entity_id: &str) {
        let Some(record) = self.entities.get(entity_id) else {
            return;
        };
        let Some(timeline) = &record.timeline else {
            return;
        };
        if record.timeline_stale {
            return;
        }
        let empty = Vec::new();
        let events = self.events.get(entity_id).unwrap_or(&empty);
        let projected = project(entity_id, events);
        let ahead = projected.current_stage.map(Stage::index)
            > timeline.current_stage.map(Stage::index);
        if ahead {
            debug!(entity_id, "projection ahead of authoritative timeline, re-fetching");
            if let Some(record) = self.entities.get_mut(entity_id) {
                record.timeline_stale = true;
            }
            let _ = self.refetch_tx.send(entity_id.to_string());
        }
    }

    fn handle_snapshot(&mut self, mode: RefreshMode, outcome: Result<OverviewSnapshot, String>) {
        match outcome {
            Ok(snapshot) => {
                // Latest snapshot wins, regardless of arrival order
                // relative to stream events.
                self.base_counts = snapshot.stage_counts;
                self.live_counts = [0; 4];

                for event in snapshot.events {
                    if !self.seen_event_ids.insert(event.id.clone()) {
                        continue;
                    }
                    self.buffer.push(event.clone());
                    if let Some(entity_id) = event.entity_id.clone() {
                        self.ensure_entity(&entity_id);
                        self.events.entry(entity_id).or_default().push(event);
                    }
                }

                for row in snapshot.entities {
                    let record = self.entities.entry(row.entity_id).or_default();
                    record.authoritative_status = row.status;
                    if row.service.is_some() {
                        record.service = row.service;
                    }
                }

                self.overview_loaded = true;
                self.overview_error = None;

                match mode {
                    RefreshMode::Normal => self.publish(&[RenderRequest::Rebuild]),
                    RefreshMode::Silent => self.publish(&[
                        RenderRequest::Patch(Region::StageCounters),
                        RenderRequest::Patch(Region::EntityTable),
                        RenderRequest::Patch(Region::Ticker),
                    ]),
                }
            }
            Err(error) => {
                warn!("overview fetch failed: {error}");
                // Error state first, then clear the feed's displayed
                // items: stale success state must never outlive a
                // failed refresh without an error indicator.
                self.overview_error = Some(error);
                self.overview_loaded = false;
                match mode {
                    RefreshMode::Normal => self.publish(&[RenderRequest::Rebuild]),
                    RefreshMode::Silent => self.publish(&[
                        RenderRequest::Patch(Region::Header),
                        RenderRequest::Patch(Region::EntityTable),
                    ]),
                }
            }
        }
    }

    fn handle_detail(
        &mut self,
        entity_id: String,
        mode: RefreshMode,
        outcome: Result<EntityDetail, String>,
    ) {
        match outcome {
            Ok(detail) => {
                let record = self.entities.entry(entity_id.clone()).or_default();
                record.timeline = Some(normalize_timeline(&detail.timeline));
                record.timeline_stale = false;
                if detail.status.is_some() {
                    record.authoritative_status = detail.status;
                }
                self.detail_errors.remove(&entity_id);
            }
            Err(error) => {
                warn!(entity_id, "detail fetch failed: {error}");
                self.detail_errors.insert(entity_id.clone(), error);
                if let Some(record) = self.entities.get_mut(&entity_id) {
                    // Fall back to the client projection until the
                    // next successful fetch.
                    record.timeline = None;
                    record.timeline_stale = false;
                }
            }
        }
        match mode {
            RefreshMode::Normal => self.publish(&[RenderRequest::Rebuild]),
            RefreshMode::Silent => self.publish(&[RenderRequest::Patch(Region::Detail)]),
        }
    }

    /// Create the record on first reference. Entities are never
    /// destroyed, only superseded on refresh.
    fn ensure_entity(&mut self, entity_id: &str) -> bool {
        if self.entities.contains_key(entity_id) {
            return false;
        }
        self.entities
            .insert(entity_id.to_string(), EntityRecord::default());
        true
    }

    fn entity_view(&self, entity_id: &str, record: &EntityRecord) -> EntityView {
        // Soft-fail persistence read: a broken store means "no
        // override present", never a crash.
        let override_status = match self.overrides.get(entity_id) {
            Ok(v) => v,
            Err(e) => {
                warn!(entity_id, "override read failed: {e}");
                None
            }
        };

        let empty = Vec::new();
        let events = self.events.get(entity_id).unwrap_or(&empty);
        let (stage_state, stage_source) = match &record.timeline {
            Some(timeline) => (timeline.clone(), StageSource::Authoritative),
            None => (project(entity_id, events), StageSource::Projected),
        };

        EntityView {
            entity_id: entity_id.to_string(),
            effective_status: override_status
                .clone()
                .or_else(|| record.authoritative_status.clone()),
            authoritative_status: record.authoritative_status.clone(),
            override_status,
            service: record.service.clone(),
            stage_state,
            stage_source,
            timeline_stale: record.timeline_stale,
        }
    }

    /// Assemble the canonical view-model. Effective status is derived
    /// here, on every call, so override changes are visible without a
    /// network round trip.
    pub fn dashboard_view(&self) -> DashboardView {
        let mut entities: Vec<EntityView> = self
            .entities
            .iter()
            .map(|(id, record)| self.entity_view(id, record))
            .collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        let mut stage_counts = self.base_counts;
        for (slot, live) in stage_counts.iter_mut().zip(self.live_counts) {
            *slot += live;
        }

        DashboardView {
            connection: self.connection,
            overview_loaded: self.overview_loaded,
            overview_error: self.overview_error.clone(),
            detail_errors: self.detail_errors.clone(),
            notice: self.notice.clone(),
            stage_counts,
            ticker: self.buffer.snapshot(),
            entities,
        }
    }

    /// Sync the shared read state, then notify the rendering layer —
    /// same turn, so a notification never points at a view that has
    /// not been written yet. Readers hold the lock only inside
    /// synchronous draw code, so blocking here is bounded.
    fn publish(&mut self, requests: &[RenderRequest]) {
        let view = self.dashboard_view();
        match self.shared.write() {
            Ok(mut shared) => *shared = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
        for request in requests {
            // Ignore send errors: no subscribers is fine.
            let _ = self.notify_tx.send(*request);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EntityRow;
    use chrono::{DateTime, TimeZone, Utc};
    use steward_core::timeline::{StepStatus, TimelineStep};

    struct Fixture {
        reconciler: Reconciler,
        notify_rx: broadcast::Receiver<RenderRequest>,
        refetch_rx: mpsc::UnboundedReceiver<String>,
        shared: SharedView,
    }

    fn fixture() -> Fixture {
        let (_input_tx, input_rx) = mpsc::channel(16);
        let (notify_tx, notify_rx) = broadcast::channel(64);
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let shared: SharedView = Arc::new(RwLock::new(DashboardView::default()));
        let reconciler = Reconciler::new(
            input_rx,
            notify_tx,
            refetch_tx,
            Arc::clone(&shared),
            OverrideStore::open_in_memory().unwrap(),
            150,
            CancellationToken::new(),
        );
        Fixture {
            reconciler,
            notify_rx,
            refetch_rx,
            shared,
        }
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    fn stage_event(id: &str, entity: &str, stage: Stage, secs: u32) -> Event {
        let mut ev = Event::new(id, at(secs), "task.stage.event");
        ev.entity_id = Some(entity.into());
        ev.stage = Some(stage);
        ev
    }

    fn overview(entities: Vec<EntityRow>) -> OverviewSnapshot {
        OverviewSnapshot {
            stage_counts: [0; 4],
            events: Vec::new(),
            entities,
        }
    }

    fn row(id: &str, status: &str) -> EntityRow {
        EntityRow {
            entity_id: id.into(),
            status: Some(status.into()),
            service: None,
            updated_at: None,
        }
    }

    fn start_overview(r: &mut Reconciler, epoch: u64) {
        r.handle(SyncInput::FeedStarted {
            feed: Feed::Overview,
            epoch,
        });
    }

    fn apply_snapshot(r: &mut Reconciler, epoch: u64, snap: OverviewSnapshot) {
        r.handle(SyncInput::Snapshot {
            epoch,
            mode: RefreshMode::Normal,
            outcome: Ok(snap),
        });
    }

    fn drain(rx: &mut broadcast::Receiver<RenderRequest>) -> Vec<RenderRequest> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    /// A reader holding the shared view must not cause a notification
    /// for a view that was never written: `publish` waits the reader
    /// out, so once a notification is visible the shared view already
    /// reflects the mutation.
    #[test]
    fn notification_never_precedes_view_sync() {
        let mut f = fixture();
        let shared = Arc::clone(&f.shared);
        let reader = std::thread::spawn(move || {
            let guard = shared.read().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            drop(guard);
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        let requests = drain(&mut f.notify_rx);
        assert!(!requests.is_empty());
        assert_eq!(f.shared.read().unwrap().entities.len(), 1);
        reader.join().unwrap();
    }

    #[test]
    fn entity_created_on_first_stream_event() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.entities.len(), 1);
        assert_eq!(view.entities[0].entity_id, "VT-1");
        assert_eq!(view.entities[0].stage_source, StageSource::Projected);
        assert_eq!(view.entities[0].stage_state.current_stage, Some(Stage::Worker));
    }

    #[test]
    fn duplicate_stream_event_is_discarded() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.ticker.len(), 1);
        assert_eq!(view.entities[0].stage_state.detail(Stage::Worker).event_count, 1);
    }

    #[test]
    fn snapshot_and_stream_events_merge_deduplicated() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Planner, 1)));
        start_overview(&mut f.reconciler, 1);
        let mut snap = overview(vec![row("VT-1", "running")]);
        snap.events = vec![
            stage_event("e1", "VT-1", Stage::Planner, 1), // dup of stream
            stage_event("e2", "VT-1", Stage::Worker, 2),
        ];
        apply_snapshot(&mut f.reconciler, 1, snap);

        let view = f.reconciler.dashboard_view();
        let entity = &view.entities[0];
        assert_eq!(entity.stage_state.detail(Stage::Planner).event_count, 1);
        assert_eq!(entity.stage_state.current_stage, Some(Stage::Worker));
    }

    #[test]
    fn latest_snapshot_wins_authoritative_status() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "queued")]));
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "running")]));
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.entities[0].authoritative_status.as_deref(), Some("running"));
        assert_eq!(view.entities[0].effective_status.as_deref(), Some("running"));
    }

    #[test]
    fn override_supersedes_authoritative_until_cleared() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "queued")]));
        f.reconciler.handle(SyncInput::SetOverride {
            entity_id: "VT-1".into(),
            status: "active".into(),
        });

        // Subsequent authoritative snapshots do not displace it.
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "failed")]));
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "done")]));
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.entities[0].effective_status.as_deref(), Some("active"));
        assert_eq!(view.entities[0].authoritative_status.as_deref(), Some("done"));

        f.reconciler.handle(SyncInput::ClearOverride {
            entity_id: "VT-1".into(),
        });
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.entities[0].effective_status.as_deref(), Some("done"));
    }

    #[test]
    fn override_change_is_visible_without_network_round_trip() {
        let mut f = fixture();
        f.reconciler.handle(SyncInput::SetOverride {
            entity_id: "VT-1".into(),
            status: "active".into(),
        });
        let view = f.shared.read().unwrap();
        assert_eq!(view.entities[0].effective_status.as_deref(), Some("active"));
    }

    #[test]
    fn authoritative_timeline_preferred_over_projection() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        f.reconciler.handle(SyncInput::Detail {
            entity_id: "VT-1".into(),
            epoch: ONE_SHOT_EPOCH,
            mode: RefreshMode::Silent,
            outcome: Ok(EntityDetail {
                entity_id: "VT-1".into(),
                status: Some("running".into()),
                timeline: vec![
                    TimelineStep {
                        stage: Stage::Planner,
                        status: StepStatus::Success,
                        latest_event: None,
                        event_count: 2,
                    },
                    TimelineStep {
                        stage: Stage::Worker,
                        status: StepStatus::Running,
                        latest_event: None,
                        event_count: 1,
                    },
                ],
            }),
        });

        let view = f.reconciler.dashboard_view();
        let entity = &view.entities[0];
        assert_eq!(entity.stage_source, StageSource::Authoritative);
        assert_eq!(entity.stage_state.completed_stages, vec![Stage::Planner]);
        assert_eq!(entity.stage_state.current_stage, Some(Stage::Worker));
    }

    #[test]
    fn projection_ahead_of_timeline_triggers_refetch() {
        let mut f = fixture();
        f.reconciler.handle(SyncInput::Detail {
            entity_id: "VT-1".into(),
            epoch: ONE_SHOT_EPOCH,
            mode: RefreshMode::Silent,
            outcome: Ok(EntityDetail {
                entity_id: "VT-1".into(),
                status: None,
                timeline: vec![TimelineStep {
                    stage: Stage::Validator,
                    status: StepStatus::Running,
                    latest_event: None,
                    event_count: 1,
                }],
            }),
        });

        // Stream says DEPLOY reached; authoritative still says VALIDATOR.
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Deploy, 5)));

        assert_eq!(f.refetch_rx.try_recv().unwrap(), "VT-1");
        let view = f.reconciler.dashboard_view();
        // Authoritative still wins for display while the re-fetch is
        // in flight.
        assert_eq!(view.entities[0].stage_source, StageSource::Authoritative);
        assert!(view.entities[0].timeline_stale);
    }

    #[test]
    fn refetch_requested_once_per_disagreement() {
        let mut f = fixture();
        f.reconciler.handle(SyncInput::Detail {
            entity_id: "VT-1".into(),
            epoch: ONE_SHOT_EPOCH,
            mode: RefreshMode::Silent,
            outcome: Ok(EntityDetail {
                entity_id: "VT-1".into(),
                status: None,
                timeline: vec![TimelineStep {
                    stage: Stage::Planner,
                    status: StepStatus::Running,
                    latest_event: None,
                    event_count: 1,
                }],
            }),
        });
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Deploy, 5)));
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e2", "VT-1", Stage::Deploy, 6)));
        assert!(f.refetch_rx.try_recv().is_ok());
        assert!(f.refetch_rx.try_recv().is_err());
    }

    #[test]
    fn stale_snapshot_from_stopped_feed_is_dropped() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        f.reconciler.handle(SyncInput::FeedStopped {
            feed: Feed::Overview,
            epoch: 1,
        });
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "running")]));
        assert!(f.reconciler.dashboard_view().entities.is_empty());
    }

    #[test]
    fn snapshot_from_older_epoch_is_dropped() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 2);
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "running")]));
        assert!(f.reconciler.dashboard_view().entities.is_empty());
        apply_snapshot(&mut f.reconciler, 2, overview(vec![row("VT-1", "running")]));
        assert_eq!(f.reconciler.dashboard_view().entities.len(), 1);
    }

    #[test]
    fn failed_fetch_sets_error_then_clears_feed() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "running")]));
        assert!(f.reconciler.dashboard_view().overview_loaded);

        f.reconciler.handle(SyncInput::Snapshot {
            epoch: 1,
            mode: RefreshMode::Silent,
            outcome: Err("connection refused".into()),
        });
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.overview_error.as_deref(), Some("connection refused"));
        assert!(!view.overview_loaded);
    }

    #[test]
    fn connection_and_snapshot_errors_are_independent() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::Connection(ConnectionState::Connected));
        start_overview(&mut f.reconciler, 1);
        f.reconciler.handle(SyncInput::Snapshot {
            epoch: 1,
            mode: RefreshMode::Silent,
            outcome: Err("HTTP 500".into()),
        });
        let view = f.reconciler.dashboard_view();
        // A healthy stream must not mask a failing poller.
        assert_eq!(view.connection, ConnectionState::Connected);
        assert_eq!(view.overview_error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn silent_snapshot_emits_patches_not_rebuild() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        drain(&mut f.notify_rx);
        f.reconciler.handle(SyncInput::Snapshot {
            epoch: 1,
            mode: RefreshMode::Silent,
            outcome: Ok(overview(vec![])),
        });
        let requests = drain(&mut f.notify_rx);
        assert!(!requests.is_empty());
        assert!(requests.iter().all(|r| matches!(r, RenderRequest::Patch(_))));
    }

    #[test]
    fn normal_snapshot_emits_rebuild() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        drain(&mut f.notify_rx);
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "running")]));
        assert!(drain(&mut f.notify_rx).contains(&RenderRequest::Rebuild));
    }

    #[test]
    fn new_entity_from_stream_escalates_to_rebuild() {
        let mut f = fixture();
        drain(&mut f.notify_rx);
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        assert_eq!(drain(&mut f.notify_rx), vec![RenderRequest::Rebuild]);

        // A second event for a known entity only patches.
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e2", "VT-1", Stage::Worker, 2)));
        let requests = drain(&mut f.notify_rx);
        assert!(requests.iter().all(|r| matches!(r, RenderRequest::Patch(_))));
    }

    #[test]
    fn stage_counts_combine_snapshot_base_and_stream_increments() {
        let mut f = fixture();
        start_overview(&mut f.reconciler, 1);
        let mut snap = overview(vec![]);
        snap.stage_counts = [4, 3, 0, 0];
        apply_snapshot(&mut f.reconciler, 1, snap);
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e9", "VT-1", Stage::Worker, 1)));
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.stage_counts[Stage::Planner.index()], 4);
        assert_eq!(view.stage_counts[Stage::Worker.index()], 4);

        // The next snapshot resets the live increments.
        let mut snap = overview(vec![]);
        snap.stage_counts = [4, 4, 0, 0];
        apply_snapshot(&mut f.reconciler, 1, snap);
        assert_eq!(f.reconciler.dashboard_view().stage_counts[Stage::Worker.index()], 4);
    }

    #[test]
    fn detail_failure_falls_back_to_projection() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        f.reconciler.handle(SyncInput::Detail {
            entity_id: "VT-1".into(),
            epoch: ONE_SHOT_EPOCH,
            mode: RefreshMode::Silent,
            outcome: Ok(EntityDetail {
                entity_id: "VT-1".into(),
                status: None,
                timeline: vec![TimelineStep {
                    stage: Stage::Worker,
                    status: StepStatus::Running,
                    latest_event: None,
                    event_count: 1,
                }],
            }),
        });
        assert_eq!(
            f.reconciler.dashboard_view().entities[0].stage_source,
            StageSource::Authoritative
        );

        f.reconciler.handle(SyncInput::Detail {
            entity_id: "VT-1".into(),
            epoch: ONE_SHOT_EPOCH,
            mode: RefreshMode::Silent,
            outcome: Err("HTTP 502".into()),
        });
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.entities[0].stage_source, StageSource::Projected);
        assert_eq!(view.detail_errors.get("VT-1").map(String::as_str), Some("HTTP 502"));
    }

    #[test]
    fn shared_view_synced_same_turn_as_mutation() {
        let mut f = fixture();
        f.reconciler
            .handle(SyncInput::StreamEvent(stage_event("e1", "VT-1", Stage::Worker, 1)));
        let view = f.shared.read().unwrap();
        assert_eq!(view.entities.len(), 1);
        assert_eq!(view.ticker.len(), 1);
    }

    #[test]
    fn notice_set_and_dismissed() {
        let mut f = fixture();
        f.reconciler.handle(SyncInput::Notice("approve failed".into()));
        assert_eq!(
            f.reconciler.dashboard_view().notice.as_deref(),
            Some("approve failed")
        );
        f.reconciler.handle(SyncInput::DismissNotice);
        assert_eq!(f.reconciler.dashboard_view().notice, None);
    }

    #[test]
    fn broken_override_store_degrades_to_no_override() {
        let mut f = fixture();
        // Drop the table out from under the store to force read errors.
        f.reconciler
            .overrides
            .conn_for_tests()
            .execute_batch("DROP TABLE status_overrides;")
            .unwrap();
        start_overview(&mut f.reconciler, 1);
        apply_snapshot(&mut f.reconciler, 1, overview(vec![row("VT-1", "running")]));
        let view = f.reconciler.dashboard_view();
        assert_eq!(view.entities[0].override_status, None);
        assert_eq!(view.entities[0].effective_status.as_deref(), Some("running"));
    }
}
