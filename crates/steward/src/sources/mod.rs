//! Input sources feeding the reconciler: the push event stream and
//! the polled snapshot feeds. Sources never touch synchronized state
//! directly; they only send `SyncInput`s.

pub mod poller;
pub mod stream;
