//! Tool definition and catalog descriptor value objects.

use super::{GatewayDomainError, ServerId, ToolName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A tool as declared by one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    name: ToolName,
    description: String,
    input_schema: Value,
}

impl ToolDefinition {
    /// Creates a tool definition.
    ///
    /// The description may be empty; servers are not required to document
    /// their tools.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError`] when the name is invalid.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Result<Self, GatewayDomainError> {
        Ok(Self {
            name: ToolName::new(name)?,
            description: description.into().trim().to_owned(),
            input_schema,
        })
    }

    /// Returns the tool name.
    #[must_use]
    pub const fn name(&self) -> &ToolName {
        &self.name
    }

    /// Returns the human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the input-shape schema.
    #[must_use]
    pub const fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Returns the argument keys the schema marks as required.
    ///
    /// Only the top-level `required` array is consulted.
    #[must_use]
    pub fn required_arguments(&self) -> Vec<&str> {
        required_keys(&self.input_schema)
    }
}

/// Catalog view of a tool: its metadata and current provider set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Catalog key.
    pub name: ToolName,
    /// Human-readable description.
    pub description: String,
    /// Input-shape schema.
    pub input_schema: Value,
    /// Servers currently declaring the tool, regardless of status.
    pub providers: BTreeSet<ServerId>,
}

impl ToolDescriptor {
    /// Returns the argument keys the schema marks as required.
    #[must_use]
    pub fn required_arguments(&self) -> Vec<&str> {
        required_keys(&self.input_schema)
    }
}

fn required_keys(schema: &Value) -> Vec<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|keys| keys.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}
