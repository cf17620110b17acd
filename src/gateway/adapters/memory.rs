//! In-memory tool-server adapter for tests and local deterministic flows.

use crate::gateway::{
    domain::{Endpoint, ServerDescriptor, ServerId, ServerRecord, ToolName},
    ports::{ToolServerTransport, TransportError, TransportResult, deadline_after},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory tool-server adapter.
///
/// Models reachable tool servers without opening sockets. Every server is
/// healthy and echoes its arguments unless told otherwise. Calls are counted
/// per server so routing decisions can be asserted.
#[derive(Debug, Clone, Default)]
pub struct InMemoryToolServers {
    state: Arc<RwLock<InMemoryServersState>>,
    probes: Arc<ProbeGauge>,
}

/// Probes currently running and the most seen at once.
#[derive(Debug, Default)]
struct ProbeGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ProbeGauge {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct InMemoryServersState {
    unhealthy: HashMap<ServerId, String>,
    failing: HashMap<ServerId, TransportError>,
    latency: HashMap<ServerId, Duration>,
    probe_delay: Option<Duration>,
    calls: HashMap<ServerId, u64>,
    tool_calls: HashMap<(ServerId, ToolName), u64>,
    infos: HashMap<String, ServerDescriptor>,
}

impl InMemoryToolServers {
    /// Creates an adapter with no scripted behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryServersState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryServersState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes health probes against `server_id` fail with `message`.
    pub fn set_unhealthy(&self, server_id: &ServerId, message: impl Into<String>) {
        self.write()
            .unhealthy
            .insert(server_id.clone(), message.into().trim().to_owned());
    }

    /// Makes health probes against `server_id` succeed again.
    pub fn set_healthy(&self, server_id: &ServerId) {
        self.write().unhealthy.remove(server_id);
    }

    /// Makes every invocation against `server_id` fail with `error`.
    pub fn set_failing(&self, server_id: &ServerId, error: TransportError) {
        self.write().failing.insert(server_id.clone(), error);
    }

    /// Restores normal invocation behaviour for `server_id`.
    pub fn clear_failing(&self, server_id: &ServerId) {
        self.write().failing.remove(server_id);
    }

    /// Delays every invocation against `server_id` by `latency`.
    pub fn set_latency(&self, server_id: &ServerId, latency: Duration) {
        self.write().latency.insert(server_id.clone(), latency);
    }

    /// Makes every health probe take `delay` before answering.
    pub fn set_probe_delay(&self, delay: Duration) {
        self.write().probe_delay = Some(delay);
    }

    /// Returns the largest number of probes that were running at once.
    #[must_use]
    pub fn peak_concurrent_probes(&self) -> usize {
        self.probes.peak.load(Ordering::SeqCst)
    }

    /// Publishes an info response at `endpoint` for discovery.
    pub fn publish_info(&self, endpoint: &Endpoint, descriptor: ServerDescriptor) {
        self.write()
            .infos
            .insert(endpoint.address().to_owned(), descriptor);
    }

    /// Returns how many invocations reached `server_id`, failed ones included.
    #[must_use]
    pub fn calls_to(&self, server_id: &ServerId) -> u64 {
        self.read().calls.get(server_id).copied().unwrap_or_default()
    }

    /// Returns how many invocations of `tool` reached `server_id`.
    #[must_use]
    pub fn tool_calls_to(&self, server_id: &ServerId, tool: &ToolName) -> u64 {
        self.read()
            .tool_calls
            .get(&(server_id.clone(), tool.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// Forgets recorded call counts.
    pub fn reset_calls(&self) {
        let mut state = self.write();
        state.calls.clear();
        state.tool_calls.clear();
    }
}

#[async_trait]
impl ToolServerTransport for InMemoryToolServers {
    async fn invoke(
        &self,
        server: &ServerRecord,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> TransportResult<Value> {
        let (latency, failure) = {
            let mut state = self.write();
            *state.calls.entry(server.id().clone()).or_default() += 1;
            *state
                .tool_calls
                .entry((server.id().clone(), tool.clone()))
                .or_default() += 1;
            (
                state.latency.get(server.id()).copied(),
                state.failing.get(server.id()).cloned(),
            )
        };

        if let Some(delay) = latency {
            let ready_at = deadline_after(delay);
            if ready_at > deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(TransportError::Timeout(delay));
            }
            tokio::time::sleep_until(ready_at).await;
        }

        if let Some(error) = failure {
            return Err(error);
        }

        Ok(json!({
            "server": server.id().as_str(),
            "tool": tool.as_str(),
            "args": args,
        }))
    }

    async fn probe(&self, server: &ServerRecord, _timeout: Duration) -> TransportResult<()> {
        self.probes.enter();
        let delay = self.read().probe_delay;
        if let Some(pause) = delay {
            tokio::time::sleep(pause).await;
        }
        let outcome = self
            .read()
            .unhealthy
            .get(server.id())
            .map_or(Ok(()), |message| Err(TransportError::Unhealthy(message.clone())));
        self.probes.leave();
        outcome
    }

    async fn describe(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> TransportResult<ServerDescriptor> {
        self.read()
            .infos
            .get(endpoint.address())
            .cloned()
            .ok_or_else(|| {
                TransportError::io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("nothing listening at {endpoint}"),
                ))
            })
    }
}
