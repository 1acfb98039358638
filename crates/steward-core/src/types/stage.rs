use serde::{Deserialize, Serialize};

use super::Event;

/// The four-step lifecycle every tracked entity moves through.
/// Derive Ord so later stages compare greater than earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planner = 0,
    Worker = 1,
    Validator = 2,
    Deploy = 3,
}

impl Stage {
    /// All stages in lifecycle order.
    pub const ALL: [Stage; 4] = [Stage::Planner, Stage::Worker, Stage::Validator, Stage::Deploy];

    /// Zero-based position in the lifecycle sequence.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Stage> {
        Stage::ALL.get(index).copied()
    }

    /// Human-facing label used by status output and the TUI.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Planner => "planner",
            Stage::Worker => "worker",
            Stage::Validator => "validator",
            Stage::Deploy => "deploy",
        }
    }
}

/// Which source of truth produced a displayed `StageState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    /// Backend-provided stage timeline.
    Authoritative,
    /// Client-side projection over the merged event set. Fallback
    /// used until the authoritative timeline has loaded.
    Projected,
}

/// Per-stage detail inside a `StageState`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageDetail {
    pub reached: bool,
    pub latest_event: Option<Event>,
    pub event_count: usize,
}

/// Derived lifecycle position of one tracked entity.
///
/// Invariant: `completed_stages`, `current_stage`, and
/// `pending_stages` partition `Stage::ALL` without overlap.
/// `current_stage` is the highest-index stage with at least one
/// associated event, `None` iff no stage has any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub current_stage: Option<Stage>,
    pub completed_stages: Vec<Stage>,
    pub pending_stages: Vec<Stage>,
    /// Indexed by `Stage::index()`.
    details: [StageDetail; 4],
}

impl StageState {
    pub fn new(
        current_stage: Option<Stage>,
        completed_stages: Vec<Stage>,
        pending_stages: Vec<Stage>,
        details: [StageDetail; 4],
    ) -> Self {
        Self {
            current_stage,
            completed_stages,
            pending_stages,
            details,
        }
    }

    /// Empty state: nothing reached, all stages pending.
    pub fn empty() -> Self {
        Self {
            current_stage: None,
            completed_stages: Vec::new(),
            pending_stages: Stage::ALL.to_vec(),
            details: Default::default(),
        }
    }

    pub fn detail(&self, stage: Stage) -> &StageDetail {
        &self.details[stage.index()]
    }

    /// Three-way classification used by rendering: has the stage been
    /// completed, is it current, or still pending.
    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    pub fn is_pending(&self, stage: Stage) -> bool {
        self.pending_stages.contains(&stage)
    }
}
