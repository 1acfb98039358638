//! Render scheduling: full rebuild vs named-region patch, with
//! scroll-offset and input-focus preservation around rebuilds.
//!
//! The scheduler is deliberately synchronous and terminal-free so the
//! decision logic and the capture/restore bookkeeping can be tested
//! without a TTY. The TUI loop feeds it `RenderRequest`s, applies the
//! returned plans, and calls the restore accessors on the next draw
//! (deferred: the rebuilt widgets must exist before offsets can be
//! reapplied).

use std::collections::{HashMap, HashSet, VecDeque};

/// Named regions the reconciler can target with an incremental patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Header,
    StageCounters,
    Ticker,
    EntityTable,
    Detail,
}

/// Update notification emitted by the reconciler after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderRequest {
    /// Rebuild the whole visual tree for the active route.
    Rebuild,
    /// Background ("silent") update touching one named region.
    Patch(Region),
}

/// Active screen. Scroll offsets are keyed per route so returning to
/// a screen restores where the operator left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Overview,
    Detail,
}

/// What the TUI should actually do for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPlan {
    FullRebuild,
    PatchRegion(Region),
}

/// Key resolution inputs for an independently scrollable region.
/// Priority order: explicit key, structural identifier, positional
/// fallback.
#[derive(Debug, Clone, Default)]
pub struct RegionDescriptor {
    pub explicit_key: Option<String>,
    pub structural_id: Option<String>,
    pub position: usize,
}

impl RegionDescriptor {
    pub fn explicit(key: impl Into<String>) -> Self {
        Self {
            explicit_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn resolve_key(&self) -> String {
        if let Some(key) = &self.explicit_key {
            return key.clone();
        }
        if let Some(id) = &self.structural_id {
            return format!("struct:{id}");
        }
        format!("pos:{}", self.position)
    }
}

/// Captured state of a focused text input: the uncommitted value and
/// cursor position survive a rebuild even though the rebuilt tree
/// would otherwise show the last persisted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusSnapshot {
    pub input_id: String,
    pub value: String,
    pub cursor: usize,
}

#[derive(Debug)]
pub struct RenderScheduler {
    route: Route,
    rebuild_in_progress: bool,
    /// Requests that arrived while a rebuild was in progress. A
    /// rebuild is never interrupted; these are planned afterwards.
    queued: VecDeque<RenderRequest>,
    /// Recorded scroll offsets keyed by (route, resolved region key).
    scroll: HashMap<(Route, String), u16>,
    /// Region keys captured by the rebuild in progress, awaiting
    /// restoration on the next draw.
    pending_restore: HashSet<(Route, String)>,
    focus: Option<FocusSnapshot>,
    /// Named incremental handlers registered per (route, region).
    patch_handlers: HashSet<(Route, Region)>,
}

impl RenderScheduler {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            rebuild_in_progress: false,
            queued: VecDeque::new(),
            scroll: HashMap::new(),
            pending_restore: HashSet::new(),
            focus: None,
            patch_handlers: HashSet::new(),
        }
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    /// Register an incremental handler: `region` on `route` can be
    /// repopulated in place without a full rebuild.
    pub fn register_patch_handler(&mut self, route: Route, region: Region) {
        self.patch_handlers.insert((route, region));
    }

    pub fn rebuild_in_progress(&self) -> bool {
        self.rebuild_in_progress
    }

    /// Decide how to apply one update. Returns `None` when the
    /// request was queued behind an in-progress rebuild.
    pub fn plan(&mut self, request: RenderRequest) -> Option<RenderPlan> {
        if self.rebuild_in_progress {
            self.queued.push_back(request);
            return None;
        }
        Some(match request {
            RenderRequest::Rebuild => RenderPlan::FullRebuild,
            RenderRequest::Patch(region) => {
                if self.patch_handlers.contains(&(self.route, region)) {
                    RenderPlan::PatchRegion(region)
                } else {
                    // No incremental handler for this screen: fall
                    // back to a full rebuild.
                    RenderPlan::FullRebuild
                }
            }
        })
    }

    /// Start a full rebuild: record every scrollable region's offset
    /// under its resolved key, and the focused input if any.
    pub fn begin_rebuild(
        &mut self,
        regions: &[(RegionDescriptor, u16)],
        focus: Option<FocusSnapshot>,
    ) {
        for (descriptor, offset) in regions {
            let key = (self.route, descriptor.resolve_key());
            self.scroll.insert(key.clone(), *offset);
            self.pending_restore.insert(key);
        }
        if focus.is_some() {
            self.focus = focus;
        }
        self.rebuild_in_progress = true;
    }

    /// Finish the rebuild's synchronous work and drain the requests
    /// that queued up behind it, in arrival order.
    pub fn complete_rebuild(&mut self) -> Vec<RenderPlan> {
        self.rebuild_in_progress = false;
        let queued: Vec<RenderRequest> = self.queued.drain(..).collect();
        queued.into_iter().filter_map(|r| self.plan(r)).collect()
    }

    /// Re-locate a region by key and take its recorded offset.
    /// Returns `None` when the key was never captured (e.g. a region
    /// that did not exist before the rebuild).
    pub fn restore_scroll(&mut self, descriptor: &RegionDescriptor) -> Option<u16> {
        let key = (self.route, descriptor.resolve_key());
        if self.pending_restore.remove(&key) {
            self.scroll.get(&key).copied()
        } else {
            None
        }
    }

    /// Last recorded offset for a region, restored or not. Used when
    /// re-entering a route.
    pub fn recorded_scroll(&self, descriptor: &RegionDescriptor) -> Option<u16> {
        self.scroll.get(&(self.route, descriptor.resolve_key())).copied()
    }

    /// Record a region's offset under the active route outside a
    /// rebuild, e.g. just before leaving the route. No restoration is
    /// scheduled; `recorded_scroll` picks it up on re-entry.
    pub fn record_scroll(&mut self, descriptor: &RegionDescriptor, offset: u16) {
        self.scroll
            .insert((self.route, descriptor.resolve_key()), offset);
    }

    /// Take the captured focus snapshot. Consumed once, on the first
    /// draw after the rebuild.
    pub fn take_focus(&mut self) -> Option<FocusSnapshot> {
        self.focus.take()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
