//! Application services for registration, health, routing and insights.
//!
//! Services share one [`ServerRegistry`] by reference. The [`ToolGateway`]
//! facade constructs and wires them; the individual services remain usable
//! on their own for tests and embedding.

mod balancer;
mod catalog;
mod events;
mod gateway;
mod health;
mod insights;
mod metrics;
mod registry;
mod retirement;
mod router;

pub use balancer::{
    BalancerConfig, FailoverLedger, HealthWeighted, LeastLatency, ParseStrategyError, RoundRobin,
    SelectionContext, SelectionStrategy, StrategyKind,
};
pub use catalog::ToolCatalog;
pub use events::EventBus;
pub use gateway::{
    BackgroundTasks, DiscoveryError, DiscoveryFailure, DiscoveryReport, ToolGateway,
    parse_endpoint_uri,
};
pub use health::{HealthConfig, HealthCycleReport, HealthMonitor};
pub use insights::{AnomalyDetector, InsightsConfig, InsightsEngine, InsightsReport, Optimizer};
pub use metrics::{MetricsCollector, MetricsConfig};
pub use registry::{
    Departure, Registration, RegistryError, RegistryResult, ServerFilter, ServerRegistry,
};
pub use retirement::ServerRetirement;
pub use router::{InvocationError, InvocationResult, ToolResponse, ToolRouter};
