//! Wire form of the standard server info response used for discovery.

use crate::gateway::domain::{
    Endpoint, GatewayDomainError, ServerDescriptor, ServerId, ToolDefinition,
};
use serde::Deserialize;
use serde_json::{Value, json};

/// Info response body as published by a tool server.
#[derive(Debug, Clone, Deserialize)]
pub(super) struct ServerInfoPayload {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    capacity: Option<u32>,
    #[serde(default)]
    tools: Vec<ToolInfoPayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct ToolInfoPayload {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_object_schema")]
    input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object"})
}

impl ServerInfoPayload {
    /// Converts the payload into a descriptor reachable at `endpoint`.
    pub(super) fn into_descriptor(
        self,
        endpoint: Endpoint,
    ) -> Result<ServerDescriptor, GatewayDomainError> {
        let id = ServerId::new(self.id)?;
        let display_name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| id.to_string());
        let tools = self
            .tools
            .into_iter()
            .map(|tool| ToolDefinition::new(tool.name, tool.description, tool.input_schema))
            .collect::<Result<Vec<_>, _>>()?;

        ServerDescriptor::new(id, display_name, endpoint)?
            .with_tools(tools)?
            .with_capacity(self.capacity.unwrap_or(1))
    }
}
