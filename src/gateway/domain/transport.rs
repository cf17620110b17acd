//! Transport kind and endpoint value objects.

use super::{GatewayDomainError, ParseTransportKindError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheme prefix accepted for persistent-channel endpoints.
const TCP_SCHEME: &str = "tcp://";

/// How a tool server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One connection (or pooled request) per call, bounded-time response.
    RequestResponse,
    /// Long-lived bidirectional connection multiplexing many calls.
    PersistentChannel,
}

impl TransportKind {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestResponse => "request_response",
            Self::PersistentChannel => "persistent_channel",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TransportKind {
    type Error = ParseTransportKindError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "request_response" | "http" => Ok(Self::RequestResponse),
            "persistent_channel" | "tcp" => Ok(Self::PersistentChannel),
            _ => Err(ParseTransportKindError(value.to_owned())),
        }
    }
}

/// Validated endpoint address for a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    kind: TransportKind,
    address: String,
}

impl Endpoint {
    /// Creates an endpoint for the given transport kind.
    ///
    /// Request/response endpoints must be `http://` or `https://` base URLs;
    /// a trailing slash is removed. Persistent-channel endpoints are
    /// `host:port` pairs with an optional `tcp://` prefix, which is stripped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError`] when the address is empty or does not
    /// fit the transport kind.
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Result<Self, GatewayDomainError> {
        let trimmed = address.into().trim().to_owned();
        if trimmed.is_empty() {
            return Err(GatewayDomainError::EmptyEndpoint);
        }

        let invalid = || GatewayDomainError::InvalidEndpoint {
            endpoint: trimmed.clone(),
            transport: kind.as_str().to_owned(),
        };

        let normalized = match kind {
            TransportKind::RequestResponse => {
                let has_valid_prefix =
                    trimmed.starts_with("http://") || trimmed.starts_with("https://");
                if !has_valid_prefix {
                    return Err(invalid());
                }
                trimmed.trim_end_matches('/').to_owned()
            }
            TransportKind::PersistentChannel => {
                let host_port = trimmed.strip_prefix(TCP_SCHEME).unwrap_or(&trimmed);
                let Some((host, port)) = host_port.rsplit_once(':') else {
                    return Err(invalid());
                };
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(invalid());
                }
                host_port.to_owned()
            }
        };

        Ok(Self {
            kind,
            address: normalized,
        })
    }

    /// Creates a request/response endpoint from a base URL.
    ///
    /// # Errors
    ///
    /// Returns validation errors from [`Endpoint::new`].
    pub fn http(base_url: impl Into<String>) -> Result<Self, GatewayDomainError> {
        Self::new(TransportKind::RequestResponse, base_url)
    }

    /// Creates a persistent-channel endpoint from a `host:port` pair.
    ///
    /// # Errors
    ///
    /// Returns validation errors from [`Endpoint::new`].
    pub fn channel(host_port: impl Into<String>) -> Result<Self, GatewayDomainError> {
        Self::new(TransportKind::PersistentChannel, host_port)
    }

    /// Returns the transport kind.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Returns the normalized address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::RequestResponse => formatter.write_str(&self.address),
            TransportKind::PersistentChannel => write!(formatter, "{TCP_SCHEME}{}", self.address),
        }
    }
}
