//! Pure domain model for the steward dashboard.
//!
//! Deterministic, IO-free building blocks: the event model, the
//! four-stage lifecycle projection, authoritative timeline
//! normalization, and the bounded recent-events buffer. Async
//! sources and rendering live in the `steward` crate.

pub mod buffer;
pub mod projection;
pub mod timeline;
pub mod types;

pub use buffer::EventBuffer;
pub use projection::project;
pub use timeline::{TimelineStep, StepStatus, normalize_timeline};
pub use types::{ConnectionState, Event, Stage, StageDetail, StageSource, StageState};
