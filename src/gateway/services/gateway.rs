//! Gateway facade wiring registry, router, health monitor and insights.

use super::{
    EventBus, FailoverLedger, HealthCycleReport, HealthMonitor, InsightsEngine, InsightsReport,
    InvocationResult, MetricsCollector, RegistryError, RegistryResult, ServerFilter,
    ServerRegistry, ServerRetirement, ToolResponse, ToolRouter,
};
use crate::config::GatewayConfig;
use crate::gateway::{
    adapters::ProtocolAdapter,
    domain::{
        AnomalyEvent, Endpoint, GatewayDomainError, GatewayEvent, MetricsSnapshot,
        OptimizationSuggestion, ServerDescriptor, ServerId, ServerRecord, ToolDescriptor,
        ToolName,
    },
    ports::{ToolServerTransport, TransportError, deadline_after},
};
use futures::StreamExt;
use mockable::{Clock, DefaultClock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while discovering a single endpoint.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// The URI does not name a supported endpoint.
    #[error("invalid endpoint {uri}: {source}")]
    InvalidUri {
        /// URI as supplied.
        uri: String,
        /// Why it was rejected.
        #[source]
        source: GatewayDomainError,
    },

    /// The info response could not be fetched or decoded.
    #[error("failed to describe {endpoint}: {source}")]
    Describe {
        /// Endpoint that was queried.
        endpoint: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The described server could not be registered.
    #[error("failed to register server from {endpoint}: {source}")]
    Register {
        /// Endpoint that was queried.
        endpoint: String,
        /// Registry rejection.
        #[source]
        source: RegistryError,
    },
}

/// Failure to discover one endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryFailure {
    /// URI as supplied.
    pub uri: String,
    /// What went wrong.
    pub error: DiscoveryError,
}

/// Outcome of seeding the pool from a list of endpoints.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Registered servers, in completion order.
    pub accepted: Vec<ServerRecord>,
    /// Endpoints that were skipped.
    pub failures: Vec<DiscoveryFailure>,
}

/// Parses a discovery URI: `tcp://host:port` selects the persistent channel,
/// `http://` and `https://` select request/response.
///
/// # Errors
///
/// Returns [`GatewayDomainError::InvalidEndpoint`] for any other scheme.
pub fn parse_endpoint_uri(uri: &str) -> Result<Endpoint, GatewayDomainError> {
    let trimmed = uri.trim();
    if trimmed.starts_with("tcp://") {
        Endpoint::channel(trimmed)
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Endpoint::http(trimmed)
    } else if trimmed.is_empty() {
        Err(GatewayDomainError::EmptyEndpoint)
    } else {
        Err(GatewayDomainError::InvalidEndpoint {
            endpoint: trimmed.to_owned(),
            transport: String::from("any"),
        })
    }
}

/// Handles of the background loops started by
/// [`ToolGateway::spawn_background`].
#[derive(Debug)]
pub struct BackgroundTasks {
    health: JoinHandle<()>,
    insights: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Waits for both loops to stop.
    pub async fn join(self) {
        if let Err(err) = self.health.await {
            warn!(error = %err, "health loop ended abnormally");
        }
        if let Err(err) = self.insights.await {
            warn!(error = %err, "insights loop ended abnormally");
        }
    }
}

/// Entry point for registration, discovery, invocation and observability.
///
/// Every collaborator is constructed here and shared by reference; there is
/// no process-wide state, so independent gateways can coexist.
pub struct ToolGateway<T, C>
where
    T: ToolServerTransport + ?Sized,
    C: Clock + Send + Sync,
{
    config: GatewayConfig,
    registry: Arc<ServerRegistry<C>>,
    transport: Arc<T>,
    metrics: Arc<MetricsCollector<C>>,
    failovers: Arc<FailoverLedger>,
    retirement: Arc<ServerRetirement<C>>,
    events: Arc<EventBus<GatewayEvent>>,
    router: ToolRouter<T, C>,
    health: HealthMonitor<T, C>,
    insights: InsightsEngine,
}

impl ToolGateway<ProtocolAdapter, DefaultClock> {
    /// Creates a gateway reaching servers over HTTP and TCP channels.
    #[must_use]
    pub fn networked(config: GatewayConfig) -> Self {
        Self::new(
            Arc::new(ProtocolAdapter::networked()),
            Arc::new(DefaultClock),
            config,
        )
    }
}

impl<T, C> ToolGateway<T, C>
where
    T: ToolServerTransport + ?Sized,
    C: Clock + Send + Sync,
{
    /// Creates a gateway over `transport` with an empty registry.
    #[must_use]
    pub fn new(transport: Arc<T>, clock: Arc<C>, config: GatewayConfig) -> Self {
        let registry = Arc::new(ServerRegistry::new(Arc::clone(&clock)));
        let metrics = Arc::new(MetricsCollector::new(&config.metrics, Arc::clone(&clock)));
        let failovers = Arc::new(FailoverLedger::new());
        let events = Arc::new(EventBus::new());
        let strategy = config.balancer.strategy.build();
        let retirement = Arc::new(ServerRetirement::new(
            Arc::clone(&metrics),
            Arc::clone(&failovers),
            Arc::clone(&strategy),
        ));
        let router = ToolRouter::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&metrics),
            strategy,
            Arc::clone(&failovers),
        )
        .with_max_attempts(config.balancer.max_attempts)
        .with_ewma_alpha(config.metrics.ewma_alpha);
        let health = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&events),
            Arc::clone(&retirement),
            config.health,
            clock,
        );

        info!(
            strategy = %config.balancer.strategy,
            max_attempts = config.balancer.max_attempts,
            "tool gateway initialised"
        );
        Self {
            config,
            registry,
            transport,
            metrics,
            failovers,
            retirement,
            events,
            router,
            health,
            insights: InsightsEngine::new(config.insights),
        }
    }

    /// Returns the configuration the gateway was built with.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the shared registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ServerRegistry<C>> {
        &self.registry
    }

    /// Registers a server and probes it once.
    ///
    /// The returned record reflects the first probe: `active` when it
    /// succeeded, `degraded` when it failed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] when the id is held by a server
    /// that is not inactive.
    pub async fn register_server(
        &self,
        descriptor: ServerDescriptor,
    ) -> RegistryResult<ServerRecord> {
        let registration = self.registry.register(descriptor)?;
        if let Some(departure) = &registration.replaced {
            self.retirement.retire(departure);
        }
        self.health.probe_server(&registration.record).await;
        Ok(self
            .registry
            .get(registration.record.id())
            .unwrap_or(registration.record))
    }

    /// Removes a server and its catalog entries, then forgets its metrics,
    /// failover count and selection state.
    ///
    /// Returns `false` when the id was not registered.
    pub fn deregister_server(&self, id: &ServerId) -> bool {
        self.registry
            .deregister(id)
            .inspect(|departure| self.retirement.retire(departure))
            .is_some()
    }

    /// Fetches the info response of each URI and registers the servers it
    /// describes.
    ///
    /// Endpoints are queried concurrently, bounded by the probe concurrency
    /// limit. Failures are logged and reported, never raised.
    pub async fn discover_from_endpoints<I, S>(&self, uris: I) -> DiscoveryReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let outcomes: Vec<Result<ServerRecord, DiscoveryFailure>> =
            futures::stream::iter(uris.into_iter().map(Into::into))
                .map(|uri: String| async move {
                    self.discover_one(&uri)
                        .await
                        .map_err(|error| DiscoveryFailure { uri, error })
                })
                .buffer_unordered(self.config.health.max_concurrent_probes.max(1))
                .collect()
                .await;

        let mut report = DiscoveryReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(record) => report.accepted.push(record),
                Err(failure) => {
                    warn!(uri = %failure.uri, error = %failure.error, "skipping endpoint");
                    report.failures.push(failure);
                }
            }
        }
        info!(
            accepted = report.accepted.len(),
            failed = report.failures.len(),
            "discovery complete"
        );
        report
    }

    async fn discover_one(&self, uri: &str) -> Result<ServerRecord, DiscoveryError> {
        let endpoint = parse_endpoint_uri(uri).map_err(|source| DiscoveryError::InvalidUri {
            uri: uri.to_owned(),
            source,
        })?;
        let descriptor = self
            .transport
            .describe(&endpoint, self.config.discovery_timeout)
            .await
            .map_err(|source| DiscoveryError::Describe {
                endpoint: endpoint.to_string(),
                source,
            })?;
        debug!(server_id = %descriptor.id(), %endpoint, "endpoint described itself");
        self.register_server(descriptor)
            .await
            .map_err(|source| DiscoveryError::Register {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    /// Invokes `tool`, giving up at `deadline`.
    ///
    /// # Errors
    ///
    /// See [`ToolRouter::invoke`].
    pub async fn invoke(
        &self,
        tool: &ToolName,
        args: Value,
        deadline: Instant,
    ) -> InvocationResult<ToolResponse> {
        self.router.invoke(tool, args, deadline).await
    }

    /// Invokes `tool` with a deadline `timeout` from now.
    ///
    /// Timeouts beyond what the clock can represent mean no deadline.
    ///
    /// # Errors
    ///
    /// See [`ToolRouter::invoke`].
    pub async fn invoke_within(
        &self,
        tool: &ToolName,
        args: Value,
        timeout: Duration,
    ) -> InvocationResult<ToolResponse> {
        self.invoke(tool, args, deadline_after(timeout)).await
    }

    /// Returns a registered server.
    #[must_use]
    pub fn server(&self, id: &ServerId) -> Option<ServerRecord> {
        self.registry.get(id)
    }

    /// Lists registered servers matching `filter`.
    #[must_use]
    pub fn servers(&self, filter: &ServerFilter) -> Vec<ServerRecord> {
        self.registry.list(filter)
    }

    /// Returns every catalogued tool.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.registry.tools()
    }

    /// Returns the current provider ids of `tool`, active tier first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTool`] when no server declares it.
    pub fn resolve(&self, tool: &ToolName) -> RegistryResult<Vec<ServerId>> {
        self.registry.resolve(tool)
    }

    /// Returns per-key metric aggregates.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns retained anomalies, oldest first.
    #[must_use]
    pub fn anomalies(&self) -> Vec<AnomalyEvent> {
        self.insights.anomalies()
    }

    /// Returns retained optimization suggestions, oldest first.
    #[must_use]
    pub fn optimizations(&self) -> Vec<OptimizationSuggestion> {
        self.insights.suggestions()
    }

    /// Returns how many calls failed over away from each server.
    #[must_use]
    pub fn failover_counts(&self) -> HashMap<ServerId, u64> {
        self.failovers.counts()
    }

    /// Subscribes to status, eviction and insight events.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Lets weight suggestions change selection weights as they appear.
    pub fn set_auto_apply(&self, enabled: bool) {
        self.insights.set_auto_apply(enabled);
    }

    /// Runs one probe cycle immediately.
    pub async fn run_health_cycle(&self) -> HealthCycleReport {
        self.health.run_cycle().await
    }

    /// Runs one insights evaluation and publishes what it produced.
    pub fn run_insights_cycle(&self) -> InsightsReport {
        let snapshot = self.metrics.snapshot();
        let report = self
            .insights
            .evaluate(&snapshot, &self.registry, &self.failovers);
        for anomaly in &report.anomalies {
            self.events.publish(&GatewayEvent::Anomaly(anomaly.clone()));
        }
        for suggestion in &report.suggestions {
            self.events
                .publish(&GatewayEvent::Optimization(suggestion.clone()));
        }
        report
    }

    async fn run_insights(&self, token: CancellationToken) {
        info!(interval = ?self.config.insights.interval, "insights loop started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.insights.interval) => {}
                () = token.cancelled() => break,
            }
            let report = self.run_insights_cycle();
            debug!(
                anomalies = report.anomalies.len(),
                suggestions = report.suggestions.len(),
                "insights cycle complete"
            );
        }
        info!("insights loop stopped");
    }
}

impl<T, C> ToolGateway<T, C>
where
    T: ToolServerTransport + ?Sized + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Starts the health and insights loops on the Tokio runtime.
    ///
    /// Both loops stop once `token` is cancelled.
    #[must_use]
    pub fn spawn_background(self: &Arc<Self>, token: &CancellationToken) -> BackgroundTasks {
        let health_gateway = Arc::clone(self);
        let health_token = token.clone();
        let health = tokio::spawn(async move {
            health_gateway.health.run(health_token).await;
        });

        let insights_gateway = Arc::clone(self);
        let insights_token = token.clone();
        let insights = tokio::spawn(async move {
            insights_gateway.run_insights(insights_token).await;
        });

        BackgroundTasks { health, insights }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::adapters::InMemoryToolServers;
    use crate::gateway::domain::{ServerStatus, ToolDefinition, TransportKind};
    use rstest::{fixture, rstest};
    use serde_json::json;

    type TestGateway = ToolGateway<InMemoryToolServers, DefaultClock>;

    struct Harness {
        servers: InMemoryToolServers,
        gateway: TestGateway,
    }

    #[fixture]
    fn harness() -> Harness {
        let servers = InMemoryToolServers::new();
        let gateway = ToolGateway::new(
            Arc::new(servers.clone()),
            Arc::new(DefaultClock),
            GatewayConfig::default(),
        );
        Harness { servers, gateway }
    }

    fn id(value: &str) -> ServerId {
        ServerId::new(value).expect("valid id")
    }

    fn echo() -> ToolName {
        ToolName::new("echo").expect("valid tool")
    }

    fn descriptor(server: &str, address: &str) -> ServerDescriptor {
        ServerDescriptor::new(
            id(server),
            server,
            Endpoint::http(address).expect("valid endpoint"),
        )
        .expect("valid descriptor")
        .with_tools([ToolDefinition::new("echo", "Echo", json!({"type": "object"})).expect("valid tool")])
        .expect("unique tools")
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn first_probe_decides_initial_status(harness: Harness) {
        harness.servers.set_unhealthy(&id("sick"), "booting");

        let healthy = harness
            .gateway
            .register_server(descriptor("fine", "http://fine.local"))
            .await
            .expect("registered");
        let sick = harness
            .gateway
            .register_server(descriptor("sick", "http://sick.local"))
            .await
            .expect("registered");

        assert_eq!(healthy.status(), ServerStatus::Active);
        assert_eq!(sick.status(), ServerStatus::Degraded);
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn discovery_registers_described_servers_and_reports_failures(harness: Harness) {
        let endpoint = Endpoint::http("http://tools.local").expect("valid endpoint");
        harness
            .servers
            .publish_info(&endpoint, descriptor("described", "http://tools.local"));

        let report = harness
            .gateway
            .discover_from_endpoints([
                "http://tools.local",
                "http://missing.local",
                "ftp://nope.local",
            ])
            .await;

        let accepted: Vec<&ServerId> = report.accepted.iter().map(ServerRecord::id).collect();
        assert_eq!(accepted, vec![&id("described")]);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|failure| matches!(
            failure.error,
            DiscoveryError::InvalidUri { .. }
        )));
        assert!(report.failures.iter().any(|failure| matches!(
            failure.error,
            DiscoveryError::Describe { .. }
        )));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn deregistration_clears_metrics_and_catalog(harness: Harness) {
        harness
            .gateway
            .register_server(descriptor("s1", "http://s1.local"))
            .await
            .expect("registered");
        harness
            .gateway
            .invoke_within(&echo(), json!({}), Duration::from_secs(1))
            .await
            .expect("call succeeds");
        assert!(harness.gateway.metrics().servers.contains_key(&id("s1")));

        assert!(harness.gateway.deregister_server(&id("s1")));

        assert!(!harness.gateway.metrics().servers.contains_key(&id("s1")));
        assert!(harness.gateway.tools().is_empty());
        assert!(!harness.gateway.deregister_server(&id("s1")));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn background_loops_stop_on_cancellation(harness: Harness) {
        let gateway = Arc::new(harness.gateway);
        let token = CancellationToken::new();
        let tasks = gateway.spawn_background(&token);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), tasks.join())
            .await
            .expect("loops stop promptly");
    }

    #[rstest]
    #[case::tcp("tcp://10.0.0.1:7000", TransportKind::PersistentChannel)]
    #[case::http("http://tools.local", TransportKind::RequestResponse)]
    #[case::https("https://tools.local/", TransportKind::RequestResponse)]
    fn endpoint_uris_select_the_transport(#[case] uri: &str, #[case] expected: TransportKind) {
        let endpoint = parse_endpoint_uri(uri).expect("supported uri");
        assert_eq!(endpoint.kind(), expected);
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        assert!(parse_endpoint_uri("udp://10.0.0.1:7000").is_err());
        assert_eq!(parse_endpoint_uri("  "), Err(GatewayDomainError::EmptyEndpoint));
    }
}
