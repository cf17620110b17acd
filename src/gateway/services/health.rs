//! Periodic health probing and liveness transitions.

use super::{EventBus, ServerFilter, ServerRegistry, ServerRetirement};
use crate::config::duration_ms;
use crate::gateway::{
    domain::{GatewayEvent, HealthThresholds, ServerId, ServerRecord, ServerStatus, StatusTransition},
    ports::ToolServerTransport,
};
use futures::StreamExt;
use mockable::Clock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health monitor settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Nominal delay between probe cycles.
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// Fraction of the interval added or removed at random per cycle.
    pub jitter_ratio: f64,
    /// Upper bound on a single probe.
    #[serde(with = "duration_ms", rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,
    /// Consecutive failures that degrade an active server (k1).
    pub degrade_after: u32,
    /// Further consecutive failures that deactivate a degraded server (k2).
    pub deactivate_after: u32,
    /// How long a server may stay inactive before it is evicted.
    #[serde(with = "duration_ms", rename = "inactive_ttl_ms")]
    pub inactive_ttl: Duration,
    /// Probes in flight at once, regardless of registry size.
    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            jitter_ratio: 0.2,
            probe_timeout: Duration::from_secs(2),
            degrade_after: 3,
            deactivate_after: 3,
            inactive_ttl: Duration::from_secs(600),
            max_concurrent_probes: 16,
        }
    }
}

impl HealthConfig {
    /// Returns the status-machine thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> HealthThresholds {
        HealthThresholds::new(self.degrade_after, self.deactivate_after)
    }
}

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCycleReport {
    /// Servers probed.
    pub probed: usize,
    /// Status changes caused by the cycle.
    pub transitions: Vec<StatusTransition>,
    /// Servers evicted after staying inactive beyond the TTL.
    pub evicted: Vec<ServerId>,
}

/// Probes registered servers and drives their status transitions.
///
/// Probe failures never surface as errors; they only move servers through
/// the status machine.
pub struct HealthMonitor<T, C>
where
    T: ToolServerTransport + ?Sized,
    C: Clock + Send + Sync,
{
    registry: Arc<ServerRegistry<C>>,
    transport: Arc<T>,
    events: Arc<EventBus<GatewayEvent>>,
    retirement: Arc<ServerRetirement<C>>,
    config: HealthConfig,
    clock: Arc<C>,
}

impl<T, C> HealthMonitor<T, C>
where
    T: ToolServerTransport + ?Sized,
    C: Clock + Send + Sync,
{
    /// Creates a monitor over shared gateway state.
    #[must_use]
    pub const fn new(
        registry: Arc<ServerRegistry<C>>,
        transport: Arc<T>,
        events: Arc<EventBus<GatewayEvent>>,
        retirement: Arc<ServerRetirement<C>>,
        config: HealthConfig,
        clock: Arc<C>,
    ) -> Self {
        Self {
            registry,
            transport,
            events,
            retirement,
            config,
            clock,
        }
    }

    /// Returns the monitor settings.
    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probes one server and applies the outcome.
    pub async fn probe_server(&self, record: &ServerRecord) -> Option<StatusTransition> {
        let result = self.transport.probe(record, self.config.probe_timeout).await;
        if let Err(err) = &result {
            debug!(server_id = %record.id(), error = %err, "health probe failed");
        }

        let transition =
            self.registry
                .apply_probe(record, result.is_ok(), self.config.thresholds())?;
        log_transition(&transition);
        self.events
            .publish(&GatewayEvent::StatusChanged(transition.clone()));
        Some(transition)
    }

    /// Probes every registered server once, then evicts expired ones.
    ///
    /// At most `max_concurrent_probes` probes are in flight at a time.
    pub async fn run_cycle(&self) -> HealthCycleReport {
        let servers = self.registry.list(&ServerFilter::all());
        let probed = servers.len();

        let transitions: Vec<StatusTransition> = futures::stream::iter(servers)
            .map(|record| async move { self.probe_server(&record).await })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .filter_map(|transition| async move { transition })
            .collect()
            .await;

        let evicted = self.evict_expired();
        HealthCycleReport {
            probed,
            transitions,
            evicted,
        }
    }

    /// Evicts servers that stayed inactive beyond the TTL.
    ///
    /// Evicted servers are retired exactly like deregistered ones.
    pub fn evict_expired(&self) -> Vec<ServerId> {
        let departures = self.registry.evict_expired(self.config.inactive_ttl);
        let at = self.clock.utc();
        departures
            .into_iter()
            .map(|departure| {
                self.retirement.retire(&departure);
                let server_id = departure.server_id;
                warn!(%server_id, ttl = ?self.config.inactive_ttl, "evicted inactive tool server");
                self.events.publish(&GatewayEvent::ServerEvicted {
                    server_id: server_id.clone(),
                    at,
                });
                server_id
            })
            .collect()
    }

    /// Returns the delay before the next cycle, jittered by the ratio.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "jitter scales the interval by a random real factor"
    )]
    pub fn next_delay(&self) -> Duration {
        let spread = self.config.jitter_ratio.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return self.config.interval;
        }
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        self.config.interval.mul_f64(factor)
    }

    /// Runs probe cycles until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            max_concurrent_probes = self.config.max_concurrent_probes,
            "health monitor started"
        );
        loop {
            let report = self.run_cycle().await;
            debug!(
                probed = report.probed,
                transitions = report.transitions.len(),
                evicted = report.evicted.len(),
                "health cycle complete"
            );
            tokio::select! {
                () = tokio::time::sleep(self.next_delay()) => {}
                () = token.cancelled() => break,
            }
        }
        info!("health monitor stopped");
    }
}

fn log_transition(transition: &StatusTransition) {
    let server_id = &transition.server_id;
    let from = transition.from;
    let to = transition.to;
    let failures = transition.consecutive_failures;
    match to {
        ServerStatus::Active => {
            info!(%server_id, %from, %to, "tool server is active");
        }
        ServerStatus::Degraded | ServerStatus::Inactive => {
            warn!(%server_id, %from, %to, failures, "tool server lost health");
        }
        ServerStatus::Registering => {
            debug!(%server_id, %from, %to, "tool server re-entered registration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::adapters::InMemoryToolServers;
    use crate::gateway::domain::{CallOutcome, Endpoint, ServerDescriptor, ToolDefinition, ToolName};
    use crate::gateway::services::{FailoverLedger, MetricsCollector, MetricsConfig, RoundRobin};
    use mockable::DefaultClock;
    use rstest::{fixture, rstest};
    use serde_json::json;

    struct Harness {
        registry: Arc<ServerRegistry<DefaultClock>>,
        servers: InMemoryToolServers,
        events: Arc<EventBus<GatewayEvent>>,
        metrics: Arc<MetricsCollector<DefaultClock>>,
        failovers: Arc<FailoverLedger>,
        monitor: HealthMonitor<InMemoryToolServers, DefaultClock>,
    }

    fn harness_with(config: HealthConfig) -> Harness {
        let clock = Arc::new(DefaultClock);
        let registry = Arc::new(ServerRegistry::new(Arc::clone(&clock)));
        let servers = InMemoryToolServers::new();
        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsCollector::new(
            &MetricsConfig::default(),
            Arc::clone(&clock),
        ));
        let failovers = Arc::new(FailoverLedger::new());
        let retirement = Arc::new(ServerRetirement::new(
            Arc::clone(&metrics),
            Arc::clone(&failovers),
            Arc::new(RoundRobin::new()),
        ));
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(servers.clone()),
            Arc::clone(&events),
            retirement,
            config,
            clock,
        );
        Harness {
            registry,
            servers,
            events,
            metrics,
            failovers,
            monitor,
        }
    }

    #[fixture]
    fn harness() -> Harness {
        harness_with(HealthConfig {
            degrade_after: 3,
            deactivate_after: 2,
            ..HealthConfig::default()
        })
    }

    fn id(value: &str) -> ServerId {
        ServerId::new(value).expect("valid id")
    }

    fn register(harness: &Harness, server: &str) {
        let descriptor = ServerDescriptor::new(
            id(server),
            server,
            Endpoint::http(format!("http://{server}.local")).expect("valid endpoint"),
        )
        .expect("valid descriptor")
        .with_tools([ToolDefinition::new("echo", "", json!({})).expect("valid tool")])
        .expect("unique tools");
        harness
            .registry
            .register(descriptor)
            .expect("registration accepted");
    }

    fn status(harness: &Harness, server: &str) -> Option<ServerStatus> {
        harness.registry.get(&id(server)).map(|record| record.status())
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn first_probe_promotes_or_degrades(harness: Harness) {
        register(&harness, "up");
        register(&harness, "down");
        harness.servers.set_unhealthy(&id("down"), "refused");

        let report = harness.monitor.run_cycle().await;

        assert_eq!(report.probed, 2);
        assert_eq!(report.transitions.len(), 2);
        assert_eq!(status(&harness, "up"), Some(ServerStatus::Active));
        assert_eq!(status(&harness, "down"), Some(ServerStatus::Degraded));
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn thresholds_drive_degradation_then_inactivation(harness: Harness) {
        register(&harness, "s1");
        harness.monitor.run_cycle().await;
        harness.servers.set_unhealthy(&id("s1"), "timeout");

        for _ in 0..2 {
            harness.monitor.run_cycle().await;
        }
        assert_eq!(status(&harness, "s1"), Some(ServerStatus::Active));

        harness.monitor.run_cycle().await;
        assert_eq!(status(&harness, "s1"), Some(ServerStatus::Degraded));

        harness.monitor.run_cycle().await;
        assert_eq!(status(&harness, "s1"), Some(ServerStatus::Degraded));
        harness.monitor.run_cycle().await;
        assert_eq!(status(&harness, "s1"), Some(ServerStatus::Inactive));

        harness.servers.set_healthy(&id("s1"));
        harness.monitor.run_cycle().await;
        let record = harness.registry.get(&id("s1")).expect("still registered");
        assert_eq!(record.status(), ServerStatus::Active);
        assert_eq!(record.consecutive_failures(), 0);
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread")]
    async fn transitions_are_published(harness: Harness) {
        let mut events = harness.events.subscribe();
        register(&harness, "s1");

        harness.monitor.run_cycle().await;

        let event = events.try_recv().expect("status change published");
        assert!(matches!(
            event,
            GatewayEvent::StatusChanged(StatusTransition {
                to: ServerStatus::Active,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_inactive_servers_are_evicted() {
        let harness = harness_with(HealthConfig {
            degrade_after: 1,
            deactivate_after: 1,
            inactive_ttl: Duration::ZERO,
            ..HealthConfig::default()
        });
        let mut events = harness.events.subscribe();
        register(&harness, "s1");
        harness.servers.set_unhealthy(&id("s1"), "gone");

        for _ in 0..3 {
            harness.monitor.run_cycle().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(harness.registry.get(&id("s1")).is_none());
        let mut evicted = false;
        while let Ok(event) = events.try_recv() {
            evicted |= matches!(event, GatewayEvent::ServerEvicted { .. });
        }
        assert!(evicted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eviction_forgets_metrics_and_failovers() {
        let harness = harness_with(HealthConfig {
            degrade_after: 1,
            deactivate_after: 1,
            inactive_ttl: Duration::ZERO,
            ..HealthConfig::default()
        });
        register(&harness, "s1");
        let echo = ToolName::new("echo").expect("valid tool");
        harness
            .metrics
            .record(&id("s1"), &echo, Duration::from_millis(4), CallOutcome::TransportError);
        harness.failovers.record(&id("s1"));
        harness.servers.set_unhealthy(&id("s1"), "gone");

        for _ in 0..3 {
            harness.monitor.run_cycle().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(harness.registry.get(&id("s1")).is_none());
        let snapshot = harness.metrics.snapshot();
        assert!(!snapshot.servers.contains_key(&id("s1")));
        assert!(!snapshot.tools.contains_key(&echo));
        assert!(harness.failovers.counts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_concurrency_is_capped_regardless_of_registry_size() {
        let harness = harness_with(HealthConfig {
            max_concurrent_probes: 4,
            ..HealthConfig::default()
        });
        for index in 0..50 {
            register(&harness, &format!("s{index}"));
        }
        harness.servers.set_probe_delay(Duration::from_millis(20));

        let report = harness.monitor.run_cycle().await;

        assert_eq!(report.probed, 50);
        let peak = harness.servers.peak_concurrent_probes();
        assert!(peak <= 4, "peak of {peak} concurrent probes exceeds the cap");
        assert!(peak > 1, "probes never overlapped");
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.2)]
    #[case(0.5)]
    fn jittered_delay_stays_within_band(#[case] jitter_ratio: f64) {
        let harness = harness_with(HealthConfig {
            interval: Duration::from_secs(10),
            jitter_ratio,
            ..HealthConfig::default()
        });
        let nominal = Duration::from_secs(10);
        let spread = nominal.mul_f64(jitter_ratio);

        for _ in 0..50 {
            let delay = harness.monitor.next_delay();
            assert!(delay >= nominal.saturating_sub(spread));
            assert!(delay <= nominal.saturating_add(spread));
        }
    }
}
