mod connection;
mod event;
mod stage;

pub use connection::ConnectionState;
pub use event::Event;
pub use stage::{Stage, StageDetail, StageSource, StageState};
