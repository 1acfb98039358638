//! Client-side stage projection: derive a `StageState` for one
//! tracked entity from a list of timestamped events.
//!
//! Deterministic and side-effect free. No IO or async. Projections
//! are discarded and rebuilt on every refresh rather than patched
//! incrementally, so re-running on the same input must always yield
//! the same output.

use crate::types::{Event, Stage, StageDetail, StageState};

/// Project the stage lifecycle for `entity_id` from `events`.
///
/// Events whose `entity_id` does not match, or that carry no stage,
/// are ignored. `current_stage` is the highest-index stage with at
/// least one event; stages reached strictly before it are completed;
/// stages with no events are pending regardless of position.
///
/// Ties on `created_at` for a stage's latest event are broken by the
/// lexicographically greatest event id, so the result is stable
/// across input orderings.
pub fn project(entity_id: &str, events: &[Event]) -> StageState {
    let mut details: [StageDetail; 4] = Default::default();

    for event in events {
        if event.entity_id.as_deref() != Some(entity_id) {
            continue;
        }
        let Some(stage) = event.stage else {
            continue;
        };
        let detail = &mut details[stage.index()];
        detail.reached = true;
        detail.event_count += 1;
        let newer = match &detail.latest_event {
            None => true,
            Some(latest) => {
                (event.created_at, event.id.as_str()) > (latest.created_at, latest.id.as_str())
            }
        };
        if newer {
            detail.latest_event = Some(event.clone());
        }
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
