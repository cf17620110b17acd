//! Port contracts for the tool gateway.

mod transport;

pub use transport::{ToolServerTransport, TransportError, TransportResult, deadline_after};
