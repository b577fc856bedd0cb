//! Reconnecting push channels (WebSocket) with heartbeat and backoff.

mod reconnecting;
mod registry;
mod state;
mod transport;

pub use reconnecting::{ChannelEvent, ReconnectingChannel, NORMAL_CLOSE};
pub use registry::ChannelRegistry;
pub use state::{ChannelPolicy, ChannelState, ChannelStatus};
pub use transport::{ChannelError, Connection, Connector, Incoming, WebSocketConnector};
