//! Transport-agnostic dispatch over the per-kind adapters.

use super::{ChannelToolTransport, HttpToolTransport};
use crate::gateway::{
    domain::{Endpoint, ServerDescriptor, ServerRecord, ToolName, TransportKind},
    ports::{ToolServerTransport, TransportError, TransportResult},
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Routes each call to the adapter registered for the server's transport.
#[derive(Clone, Default)]
pub struct ProtocolAdapter {
    request_response: Option<Arc<dyn ToolServerTransport>>,
    persistent_channel: Option<Arc<dyn ToolServerTransport>>,
}

impl std::fmt::Debug for ProtocolAdapter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProtocolAdapter")
            .field("request_response", &self.request_response.is_some())
            .field("persistent_channel", &self.persistent_channel.is_some())
            .finish()
    }
}

impl ProtocolAdapter {
    /// Creates a dispatcher with no adapters; every call is unsupported.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher backed by the HTTP and TCP channel adapters.
    #[must_use]
    pub fn networked() -> Self {
        Self::new()
            .with_request_response(Arc::new(HttpToolTransport::new()))
            .with_persistent_channel(Arc::new(ChannelToolTransport::new()))
    }

    /// Installs the adapter used for request/response servers.
    #[must_use]
    pub fn with_request_response(mut self, adapter: Arc<dyn ToolServerTransport>) -> Self {
        self.request_response = Some(adapter);
        self
    }

    /// Installs the adapter used for persistent-channel servers.
    #[must_use]
    pub fn with_persistent_channel(mut self, adapter: Arc<dyn ToolServerTransport>) -> Self {
        self.persistent_channel = Some(adapter);
        self
    }

    fn adapter_for(&self, kind: TransportKind) -> TransportResult<&dyn ToolServerTransport> {
        let adapter = match kind {
            TransportKind::RequestResponse => self.request_response.as_deref(),
            TransportKind::PersistentChannel => self.persistent_channel.as_deref(),
        };
        adapter.ok_or(TransportError::Unsupported(kind))
    }
}

#[async_trait]
impl ToolServerTransport for ProtocolAdapter {
    async fn invoke(
        &self,
        server: &ServerRecord,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> TransportResult<Value> {
        self.adapter_for(server.transport())?
            .invoke(server, tool, args, deadline)
            .await
    }

    async fn probe(&self, server: &ServerRecord, timeout: Duration) -> TransportResult<()> {
        self.adapter_for(server.transport())?
            .probe(server, timeout)
            .await
    }

    async fn describe(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> TransportResult<ServerDescriptor> {
        self.adapter_for(endpoint.kind())?
            .describe(endpoint, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::adapters::InMemoryToolServers;
    use crate::gateway::domain::{ServerId, ToolDefinition};
    use mockable::DefaultClock;
    use serde_json::json;

    fn record(endpoint: Endpoint) -> ServerRecord {
        let descriptor = ServerDescriptor::new(
            ServerId::new("s1").expect("valid id"),
            "Server one",
            endpoint,
        )
        .expect("valid descriptor")
        .with_tools([ToolDefinition::new("echo", "", json!({})).expect("valid tool")])
        .expect("unique tools");
        ServerRecord::new(descriptor, &DefaultClock)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routes_by_transport_kind() {
        let http_side = InMemoryToolServers::new();
        let adapter = ProtocolAdapter::new().with_request_response(Arc::new(http_side.clone()));
        let server = record(Endpoint::http("http://one.local").expect("valid endpoint"));
        let tool = ToolName::new("echo").expect("valid tool");

        adapter
            .invoke(
                &server,
                &tool,
                json!({}),
                Instant::now() + Duration::from_secs(1),
            )
            .await
            .expect("request/response call succeeds");

        assert_eq!(http_side.calls_to(server.id()), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_adapter_is_unsupported() {
        let adapter = ProtocolAdapter::new();
        let server = record(Endpoint::channel("127.0.0.1:7000").expect("valid endpoint"));

        let result = adapter.probe(&server, Duration::from_secs(1)).await;

        assert!(matches!(
            result,
            Err(TransportError::Unsupported(TransportKind::PersistentChannel))
        ));
    }
}
