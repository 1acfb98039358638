//! One-shot `steward status` output: a single overview fetch merged
//! with the local override store, formatted for the terminal.

use std::collections::HashMap;

use steward_core::projection::project;
use steward_core::types::{Stage, StageState};

use crate::api::OverviewSnapshot;
use crate::display::stage_lane;

/// One formatted line's worth of entity state.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    pub entity_id: String,
    pub effective_status: Option<String>,
    pub overridden: bool,
    pub stage_state: StageState,
}

/// Merge a snapshot with the persisted overrides into display rows,
/// sorted by entity id. Stage positions come from the client
/// projection over the snapshot's events; a one-shot command has no
/// authoritative timeline to prefer.
pub fn build_rows(
    snapshot: &OverviewSnapshot,
    overrides: &HashMap<String, String>,
) -> Vec<StatusRow> {
    let mut rows: Vec<StatusRow> = snapshot
        .entities
        .iter()
        .map(|entity| {
            let override_status = overrides.get(&entity.entity_id);
            StatusRow {
                entity_id: entity.entity_id.clone(),
                effective_status: override_status.or(entity.status.as_ref()).cloned(),
                overridden: override_status.is_some(),
                stage_state: project(&entity.entity_id, &snapshot.events),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    rows
}

fn format_counts(stage_counts: &[u64; 4]) -> String {
    Stage::ALL
        .iter()
        .map(|stage| format!("{} {}", stage_counts[stage.index()], stage.label()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format the full status output for `steward status`.
///
/// Example output:
/// ```text
/// STEWARD Status
/// ─────────────────────────────────────────────────────────────
/// ●◉○○  VT-1  running
/// ●●●◉  VT-2  paused*
///
/// Stages: 4 planner, 3 worker, 1 validator, 1 deploy
/// * = local override
/// ```
pub fn format_status(snapshot: &OverviewSnapshot, overrides: &HashMap<String, String>) -> String {
    let rows = build_rows(snapshot, overrides);

    let mut out = String::new();
    out.push_str("STEWARD Status\n");
    out.push_str("─────────────────────────────────────────────────────────────\n");

    if rows.is_empty() {
        out.push_str("  No tracked entities.\n");
        return out;
    }

    let any_overridden = rows.iter().any(|row| row.overridden);
    for row in &rows {
        let status = row.effective_status.as_deref().unwrap_or("—");
        let marker = if row.overridden { "*" } else { "" };
        out.push_str(&format!(
            "{}  {}  {}{}\n",
            stage_lane(&row.stage_state),
            row.entity_id,
            status,
            marker,
        ));
    }

    out.push('\n');
    out.push_str(&format!("Stages: {}\n", format_counts(&snapshot.stage_counts)));
    if any_overridden {
        out.push_str("* = local override\n");
    }
    out
}
