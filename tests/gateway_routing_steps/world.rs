//! Shared world state for gateway routing BDD scenarios.

use std::sync::Arc;

use mockable::DefaultClock;
use rstest::fixture;
use serde_json::json;
use toolmesh::config::GatewayConfig;
use toolmesh::gateway::adapters::InMemoryToolServers;
use toolmesh::gateway::domain::{
    Endpoint, GatewayDomainError, ServerDescriptor, ServerId, ServerRecord, ToolDefinition,
};
use toolmesh::gateway::services::{InvocationError, RegistryResult, ToolGateway};

/// Gateway type used by the BDD world.
pub type TestGateway = ToolGateway<InMemoryToolServers, DefaultClock>;

/// Scenario world for gateway routing behaviour tests.
pub struct GatewayWorld {
    /// Scriptable tool servers behind the gateway.
    pub servers: InMemoryToolServers,
    /// The gateway under test.
    pub gateway: TestGateway,
    /// Provider (or error) of each call made by the last call step.
    pub call_results: Vec<Result<ServerId, InvocationError>>,
    /// Result of the last explicit registration attempt.
    pub last_registration: Option<RegistryResult<ServerRecord>>,
}

impl GatewayWorld {
    /// Creates a world with an empty pool and default configuration.
    #[must_use]
    pub fn new() -> Self {
        let servers = InMemoryToolServers::new();
        let gateway = ToolGateway::new(
            Arc::new(servers.clone()),
            Arc::new(DefaultClock),
            GatewayConfig::default(),
        );
        Self {
            servers,
            gateway,
            call_results: Vec::new(),
            last_registration: None,
        }
    }
}

impl Default for GatewayWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixture that creates a new scenario world.
#[fixture]
pub fn world() -> GatewayWorld {
    GatewayWorld::default()
}

/// Runs an async operation within sync step definitions.
pub fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

/// Splits a comma-separated list of server ids.
pub fn parse_ids(list: &str) -> Result<Vec<ServerId>, GatewayDomainError> {
    list.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ServerId::new)
        .collect()
}

/// Builds a descriptor for `id` declaring a single tool.
pub fn build_descriptor(id: &ServerId, tool: &str) -> Result<ServerDescriptor, GatewayDomainError> {
    let definition = ToolDefinition::new(tool, format!("{tool} tool"), json!({"type": "object"}))?;
    ServerDescriptor::new(
        id.clone(),
        id.as_str(),
        Endpoint::http(format!("http://{id}.tools.local"))?,
    )?
    .with_tools([definition])
}
