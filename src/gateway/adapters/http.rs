//! Request/response adapter speaking JSON over HTTP.
//!
//! Wire contract:
//!
//! - `POST {endpoint}/tools/{name}` with the argument object as body. A 2xx
//!   reply carries the JSON result; 400 and 422 mean the arguments were
//!   rejected; 502, 503 and 504 mean the server cannot serve right now and
//!   the call may go elsewhere; any other status is an application error.
//! - `GET {endpoint}/health` answers 2xx while the server is healthy.
//! - `GET {endpoint}/info` returns the server info document.

use super::info::ServerInfoPayload;
use crate::gateway::{
    domain::{Endpoint, ServerDescriptor, ServerRecord, ToolName},
    ports::{ToolServerTransport, TransportError, TransportResult, deadline_after},
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Well-known health probe path.
pub const HEALTH_PATH: &str = "/health";

/// Well-known info path used by discovery.
pub const INFO_PATH: &str = "/info";

/// HTTP request/response tool-server adapter.
#[derive(Debug, Clone, Default)]
pub struct HttpToolTransport {
    client: Client,
}

impl HttpToolTransport {
    /// Creates an adapter with a default connection-pooling client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an adapter around a preconfigured client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Sends `request`, aborting the exchange when `deadline` passes.
    async fn send_until(request: RequestBuilder, deadline: Instant) -> TransportResult<Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(Duration::ZERO));
        }

        match tokio::time::timeout_at(deadline, request.timeout(remaining).send()).await {
            Err(_) => Err(TransportError::Timeout(remaining)),
            Ok(Err(err)) if err.is_timeout() => Err(TransportError::Timeout(remaining)),
            Ok(Err(err)) => Err(TransportError::io(err)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    async fn read_json(
        response: Response,
        started: Instant,
        deadline: Instant,
    ) -> TransportResult<Value> {
        match tokio::time::timeout_at(deadline, response.json::<Value>()).await {
            Err(_) => Err(TransportError::Timeout(deadline.saturating_duration_since(started))),
            Ok(Err(err)) if err.is_decode() => Err(TransportError::Protocol(err.to_string())),
            Ok(Err(err)) => Err(TransportError::io(err)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn read_text(response: Response, deadline: Instant) -> String {
        tokio::time::timeout_at(deadline, response.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolServerTransport for HttpToolTransport {
    async fn invoke(
        &self,
        server: &ServerRecord,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> TransportResult<Value> {
        let started = Instant::now();
        let url = format!("{}/tools/{}", server.endpoint().address(), tool);
        debug!(server_id = %server.id(), %url, "invoking tool over http");

        let response = Self::send_until(self.client.post(&url).json(&args), deadline).await?;
        let status = response.status();
        if status.is_success() {
            return Self::read_json(response, started, deadline).await;
        }

        let body = Self::read_text(response, deadline).await;
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(TransportError::Rejected(body))
            }
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Err(TransportError::Unavailable {
                code: status.as_u16(),
                message: body,
            }),
            _ => Err(TransportError::Application {
                code: i64::from(status.as_u16()),
                message: body,
            }),
        }
    }

    async fn probe(&self, server: &ServerRecord, timeout: Duration) -> TransportResult<()> {
        let url = format!("{}{HEALTH_PATH}", server.endpoint().address());
        let response = Self::send_until(self.client.get(&url), deadline_after(timeout)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(TransportError::Unhealthy(format!(
            "health probe returned {status}"
        )))
    }

    async fn describe(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> TransportResult<ServerDescriptor> {
        let started = Instant::now();
        let deadline = deadline_after(timeout);
        let url = format!("{}{INFO_PATH}", endpoint.address());
        let response = Self::send_until(self.client.get(&url), deadline).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Protocol(format!(
                "info request returned {status}"
            )));
        }

        let body = Self::read_json(response, started, deadline).await?;
        let payload: ServerInfoPayload = serde_json::from_value(body)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        Ok(payload.into_descriptor(endpoint.clone())?)
    }
}
