use steward_core::types::{ConnectionState, Stage, StageState};

/// Indicator symbols used across TUI and status output.
pub const INDICATOR_COMPLETED: &str = "●";
pub const INDICATOR_CURRENT: &str = "◉";
pub const INDICATOR_PENDING: &str = "○";
pub const INDICATOR_STALE: &str = "◌";
pub const INDICATOR_ERROR: &str = "✖";

/// Symbol for one stage within an entity's lifecycle state.
pub fn stage_indicator(state: &StageState, stage: Stage) -> &'static str {
    if state.current_stage == Some(stage) {
        INDICATOR_CURRENT
    } else if state.is_completed(stage) {
        INDICATOR_COMPLETED
    } else {
        INDICATOR_PENDING
    }
}

/// Compact four-symbol lane, in stage order.
pub fn stage_lane(state: &StageState) -> String {
    Stage::ALL
        .iter()
        .map(|stage| stage_indicator(state, *stage))
        .collect()
}

/// Symbol for the push-stream connection state.
pub fn connection_indicator(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => INDICATOR_COMPLETED,
        ConnectionState::Connecting => INDICATOR_STALE,
        ConnectionState::Disconnected => INDICATOR_PENDING,
        ConnectionState::Degraded => INDICATOR_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StageState {
        StageState::new(
            Some(Stage::Validator),
            vec![Stage::Planner, Stage::Worker],
            vec![Stage::Deploy],
            Default::default(),
        )
    }

    #[test]
    fn stage_indicator_current_completed_pending() {
        let s = state();
        assert_eq!(stage_indicator(&s, Stage::Planner), "●");
        assert_eq!(stage_indicator(&s, Stage::Worker), "●");
        assert_eq!(stage_indicator(&s, Stage::Validator), "◉");
        assert_eq!(stage_indicator(&s, Stage::Deploy), "○");
    }

    #[test]
    fn stage_lane_follows_stage_order() {
        assert_eq!(stage_lane(&state()), "●●◉○");
        assert_eq!(stage_lane(&StageState::empty()), "○○○○");
    }

    #[test]
    fn connection_indicator_all_states() {
        assert_eq!(connection_indicator(ConnectionState::Connected), "●");
        assert_eq!(connection_indicator(ConnectionState::Connecting), "◌");
        assert_eq!(connection_indicator(ConnectionState::Disconnected), "○");
        assert_eq!(connection_indicator(ConnectionState::Degraded), "✖");
    }
}
