//! Transport port for reaching tool servers.

use crate::gateway::domain::{
    CallOutcome, Endpoint, GatewayDomainError, ServerDescriptor, ServerRecord, ToolName,
    TransportKind,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Horizon used when a timeout does not fit the monotonic clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Returns the instant `timeout` from now.
///
/// Timeouts too large for the clock are clamped to a horizon decades away,
/// so callers may pass `Duration::MAX` to mean "no deadline".
#[must_use]
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

/// Uniform contract over every way of reaching a tool server.
///
/// Implementations must honour the deadline by aborting the underlying I/O
/// once it elapses, returning [`TransportError::Timeout`].
#[async_trait]
pub trait ToolServerTransport: Send + Sync {
    /// Invokes `tool` on `server` with `args`, giving up at `deadline`.
    async fn invoke(
        &self,
        server: &ServerRecord,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> TransportResult<Value>;

    /// Calls the server's well-known health probe.
    async fn probe(&self, server: &ServerRecord, timeout: Duration) -> TransportResult<()>;

    /// Fetches the standard info response from a candidate endpoint.
    async fn describe(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> TransportResult<ServerDescriptor>;
}

/// Errors returned by transport adapters.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The deadline elapsed before a reply arrived.
    #[error("deadline elapsed after {0:?}")]
    Timeout(Duration),

    /// Connecting, writing or reading failed.
    #[error("transport I/O failure: {0}")]
    Io(Arc<dyn std::error::Error + Send + Sync>),

    /// The peer sent something that does not follow the wire contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The tool ran and reported a failure.
    #[error("tool reported error {code}: {message}")]
    Application {
        /// Error code reported by the tool server.
        code: i64,
        /// Error message reported by the tool server.
        message: String,
    },

    /// The server answered but cannot serve calls right now.
    #[error("server unavailable ({code}): {message}")]
    Unavailable {
        /// Status code reported by the server.
        code: u16,
        /// Body or reason supplied with the status.
        message: String,
    },

    /// The tool server refused the arguments.
    #[error("arguments rejected: {0}")]
    Rejected(String),

    /// The server reported itself unhealthy.
    #[error("server unhealthy: {0}")]
    Unhealthy(String),

    /// An info response could not be turned into a descriptor.
    #[error("invalid server info: {0}")]
    InvalidDescriptor(#[from] GatewayDomainError),

    /// No adapter handles this transport kind.
    #[error("no adapter configured for {0} transport")]
    Unsupported(TransportKind),
}

impl TransportError {
    /// Wraps an I/O-level failure.
    pub fn io(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Io(Arc::new(err))
    }

    /// Classifies the error as a metric outcome.
    #[must_use]
    pub const fn outcome(&self) -> CallOutcome {
        match self {
            Self::Timeout(_) => CallOutcome::Timeout,
            Self::Application { .. } | Self::Rejected(_) => CallOutcome::ApplicationError,
            Self::Io(_)
            | Self::Unavailable { .. }
            | Self::Protocol(_)
            | Self::Unhealthy(_)
            | Self::InvalidDescriptor(_)
            | Self::Unsupported(_) => CallOutcome::TransportError,
        }
    }

    /// Returns whether another provider may succeed where this one failed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.outcome().is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_arguments_are_not_transient() {
        assert!(!TransportError::Rejected("missing path".to_owned()).is_transient());
        assert!(
            !TransportError::Application {
                code: 500,
                message: "boom".to_owned()
            }
            .is_transient()
        );
    }

    #[test]
    fn io_and_timeouts_are_transient() {
        assert!(TransportError::io(std::io::Error::other("reset")).is_transient());
        assert!(TransportError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(TransportError::Protocol("garbled".to_owned()).is_transient());
        assert!(
            TransportError::Unavailable {
                code: 503,
                message: "overloaded".to_owned()
            }
            .is_transient()
        );
    }

    #[test]
    fn oversized_timeouts_clamp_to_a_distant_deadline() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn ordinary_timeouts_are_added_to_now() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::from_secs(2));
        assert!(deadline >= before + Duration::from_secs(2));
        assert!(deadline <= Instant::now() + Duration::from_secs(2));
    }
}
