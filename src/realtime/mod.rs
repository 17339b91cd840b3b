pub mod hub;
pub mod protocol;

pub use hub::{BroadcastHub, Connection, ConnectionId};
pub use protocol::{ClientEvent, ServerEvent};
