//! Error types for gateway domain validation and parsing.

use thiserror::Error;

/// Errors returned while constructing gateway domain values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayDomainError {
    /// The server identifier is empty after trimming.
    #[error("server id must not be empty")]
    EmptyServerId,

    /// The server identifier contains characters outside `[A-Za-z0-9_.-]`.
    #[error(
        "server id '{0}' contains invalid characters (only alphanumerics, '_', '-' and '.' allowed)"
    )]
    InvalidServerId(String),

    /// The server identifier exceeds the 128-character limit.
    #[error("server id exceeds 128 character limit: {0}")]
    ServerIdTooLong(String),

    /// The display name is empty after trimming.
    #[error("server display name must not be empty")]
    EmptyDisplayName,

    /// A tool name is empty after trimming.
    #[error("tool name must not be empty")]
    EmptyToolName,

    /// A tool name contains whitespace or control characters.
    #[error("tool name '{0}' must not contain whitespace or control characters")]
    InvalidToolName(String),

    /// A tool name exceeds the 128-character limit.
    #[error("tool name exceeds 128 character limit: {0}")]
    ToolNameTooLong(String),

    /// The same tool name is declared twice by one server.
    #[error("tool '{0}' is declared more than once")]
    DuplicateToolDeclaration(String),

    /// The endpoint address is empty.
    #[error("endpoint address must not be empty")]
    EmptyEndpoint,

    /// The endpoint address does not match its transport kind.
    #[error("endpoint '{endpoint}' is not valid for {transport} transport")]
    InvalidEndpoint {
        /// Endpoint as supplied.
        endpoint: String,
        /// Transport kind in canonical string form.
        transport: String,
    },

    /// Capacity weights must be at least one.
    #[error("capacity weight must be at least 1")]
    ZeroCapacity,
}

/// Error returned while parsing a server status from its string form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown server status: {0}")]
pub struct ParseServerStatusError(pub String);

/// Error returned while parsing a transport kind from its string form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown transport kind: {0}")]
pub struct ParseTransportKindError(pub String);
