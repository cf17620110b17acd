//! Identifier and validated-name types for tool servers and tools.

use super::GatewayDomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length for server identifiers and tool names.
const MAX_NAME_LENGTH: usize = 128;

/// Caller-assigned identifier of a tool server.
///
/// Identifiers are unique across a registry. Ordering is lexicographic, which
/// gives provider sets a stable iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

impl ServerId {
    /// Creates a validated server identifier.
    ///
    /// The input is trimmed. Only ASCII alphanumerics, `_`, `-` and `.` are
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError`] when validation fails.
    pub fn new(value: impl Into<String>) -> Result<Self, GatewayDomainError> {
        let normalized = value.into().trim().to_owned();

        if normalized.is_empty() {
            return Err(GatewayDomainError::EmptyServerId);
        }

        let is_valid = normalized.chars().all(|character| {
            character.is_ascii_alphanumeric() || matches!(character, '_' | '-' | '.')
        });
        if !is_valid {
            return Err(GatewayDomainError::InvalidServerId(normalized));
        }

        if normalized.len() > MAX_NAME_LENGTH {
            return Err(GatewayDomainError::ServerIdTooLong(normalized));
        }

        Ok(Self(normalized))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerId {
    type Error = GatewayDomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServerId> for String {
    fn from(value: ServerId) -> Self {
        value.0
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Validated tool name used as the catalog key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolName(String);

impl ToolName {
    /// Creates a validated tool name.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError`] when the name is empty, contains
    /// whitespace or control characters, or is too long.
    pub fn new(value: impl Into<String>) -> Result<Self, GatewayDomainError> {
        let normalized = value.into().trim().to_owned();

        if normalized.is_empty() {
            return Err(GatewayDomainError::EmptyToolName);
        }

        if normalized
            .chars()
            .any(|character| character.is_whitespace() || character.is_control())
        {
            return Err(GatewayDomainError::InvalidToolName(normalized));
        }

        if normalized.len() > MAX_NAME_LENGTH {
            return Err(GatewayDomainError::ToolNameTooLong(normalized));
        }

        Ok(Self(normalized))
    }

    /// Returns the tool name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ToolName {
    type Error = GatewayDomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ToolName> for String {
    fn from(value: ToolName) -> Self {
        value.0
    }
}

impl AsRef<str> for ToolName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Unique identifier for an advisory anomaly or optimization record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsightId(Uuid);

impl InsightId {
    /// Creates a new random insight identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the wrapped UUID.
    #[must_use]
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for InsightId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InsightId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}
