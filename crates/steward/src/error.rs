//! Error taxonomy for the sync layer.
//!
//! Transport errors are recovered automatically (stream backoff, next
//! poll tick). Protocol errors drop the offending message only.
//! Persistence errors degrade to "no override present". Action
//! rejections surface as transient notices and roll back optimistic
//! state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("action rejected: {0}")]
    ActionRejected(String),
}
