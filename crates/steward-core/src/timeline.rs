//! Normalization of the backend-provided authoritative stage timeline
//! into the same `StageState` shape the client-side projection
//! produces, so rendering never branches on which source is active.

use serde::{Deserialize, Serialize};

use crate::types::{Event, Stage, StageDetail, StageState};

/// Per-stage status vocabulary used by the backend timeline endpoint.
/// The legacy `COMPLETED` spelling is a synonym for `SUCCESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl StepStatus {
    /// Tolerant parse. Unknown vocabulary yields `None` so the caller
    /// can drop the step and keep the rest of the timeline.
    pub fn parse(s: &str) -> Option<StepStatus> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(StepStatus::Pending),
            "RUNNING" => Some(StepStatus::Running),
            "SUCCESS" | "COMPLETED" => Some(StepStatus::Success),
            "ERROR" => Some(StepStatus::Error),
            _ => None,
        }
    }

    /// A stage counts as reached once the backend reports it left
    /// `PENDING`, whether it is still running, finished, or failed.
    pub fn reached(self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

/// One entry of the authoritative timeline, already typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineStep {
    pub stage: Stage,
    pub status: StepStatus,
    #[serde(default)]
    pub latest_event: Option<Event>,
    #[serde(default)]
    pub event_count: usize,
}

/// Collapse an authoritative timeline into the three-way
/// completed/current/pending classification.
///
/// Stages absent from `steps` are treated as pending. When the same
/// stage appears more than once the last entry wins (the backend
/// emits at most one, but a duplicate must not panic).
pub fn normalize_timeline(steps: &[TimelineStep]) -> StageState {
    let mut details: [StageDetail; 4] = Default::default();

    for step in steps {
        let detail = &mut details[step.stage.index()];
        detail.reached = step.status.reached();
        detail.latest_event = step.latest_event.clone();
        detail.event_count = step.event_count;
    }

    let current_stage = Stage::ALL
        .iter()
        .rev()
        .find(|s| details[s.index()].reached)
        .copied();

    let mut completed = Vec::new();
    let mut pending = Vec::new();
    for stage in Stage::ALL {
        let reached = details[stage.index()].reached;
        match current_stage {
            Some(current) if stage == current => {}
            Some(current) if stage < current && reached => completed.push(stage),
            _ => {
                if !reached {
                    pending.push(stage);
                }
            }
        }
    }

    StageState::new(current_stage, completed, pending, details)
}
