//! Adapter implementations of the tool-server transport port.

mod channel;
mod dispatch;
mod http;
mod info;
mod memory;

pub use channel::{ChannelToolTransport, HEALTH_TOOL, INFO_TOOL, INVALID_PARAMS_CODE};
pub use dispatch::ProtocolAdapter;
pub use http::{HEALTH_PATH, HttpToolTransport, INFO_PATH};
pub use memory::InMemoryToolServers;
