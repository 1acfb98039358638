//! Operator dashboard for the four-stage task lifecycle: live state
//! synchronization (push stream + polled snapshots + local overrides)
//! and an incremental-update TUI over the merged view.

pub mod api;
pub mod display;
pub mod error;
pub mod overrides;
pub mod pipeline;
pub mod reconciler;
pub mod render;
pub mod sources;
pub mod status;
pub mod tui;
