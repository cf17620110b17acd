//! Domain model for the tool gateway.
//!
//! The gateway domain models tool-server identity, endpoints, declared tools,
//! the liveness state machine, invocation outcomes and the advisory records
//! derived from metrics. Infrastructure concerns remain outside this boundary.

mod error;
mod event;
mod ids;
mod insight;
mod metric;
mod server;
mod status;
mod tool;
mod transport;

pub use error::{GatewayDomainError, ParseServerStatusError, ParseTransportKindError};
pub use event::GatewayEvent;
pub use ids::{InsightId, ServerId, ToolName};
pub use insight::{
    AnomalyEvent, AnomalyEvidence, AnomalyKind, MetricScope, OptimizationSuggestion, Severity,
    SuggestedAction,
};
pub use metric::{CallOutcome, MetricsSnapshot, RequestMetric, WindowAggregate};
pub use server::{ServerDescriptor, ServerRecord, StatusTransition};
pub use status::{HealthThresholds, ServerStatus};
pub use tool::{ToolDefinition, ToolDescriptor};
pub use transport::{Endpoint, TransportKind};
