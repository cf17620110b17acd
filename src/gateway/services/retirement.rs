//! Cleanup shared by every way a server leaves the registry.

use super::{Departure, FailoverLedger, MetricsCollector, SelectionStrategy};
use mockable::Clock;
use std::sync::Arc;
use tracing::debug;

/// Forgets the bookkeeping kept for servers and tools that left the pool.
///
/// Deregistration, replacement of an inactive record and TTL eviction all
/// go through [`ServerRetirement::retire`], so a server registered again
/// under the same id starts with a clean history.
#[derive(Debug)]
pub struct ServerRetirement<C>
where
    C: Clock + Send + Sync,
{
    metrics: Arc<MetricsCollector<C>>,
    failovers: Arc<FailoverLedger>,
    strategy: Arc<dyn SelectionStrategy>,
}

impl<C> ServerRetirement<C>
where
    C: Clock + Send + Sync,
{
    /// Creates a retirement routine over shared gateway state.
    #[must_use]
    pub const fn new(
        metrics: Arc<MetricsCollector<C>>,
        failovers: Arc<FailoverLedger>,
        strategy: Arc<dyn SelectionStrategy>,
    ) -> Self {
        Self {
            metrics,
            failovers,
            strategy,
        }
    }

    /// Drops metrics windows, failover counts and selection state of the
    /// departed server and of the tools it was the last to provide.
    pub fn retire(&self, departure: &Departure) {
        let server_id = &departure.server_id;
        self.metrics.forget_server(server_id);
        self.failovers.reset(server_id);
        self.strategy.forget_server(server_id);
        for tool in &departure.retired_tools {
            self.metrics.forget_tool(tool);
            self.strategy.forget_tool(tool);
        }
        debug!(
            %server_id,
            retired_tools = departure.retired_tools.len(),
            "forgot state of departed server"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::domain::{CallOutcome, ServerId, ToolName};
    use crate::gateway::services::{MetricsConfig, RoundRobin, SelectionContext};
    use mockable::DefaultClock;
    use std::time::Duration;

    #[test]
    fn retiring_clears_every_trace_of_the_server() {
        let metrics = Arc::new(MetricsCollector::new(
            &MetricsConfig::default(),
            Arc::new(DefaultClock),
        ));
        let failovers = Arc::new(FailoverLedger::new());
        let strategy = Arc::new(RoundRobin::new());
        let shared: Arc<dyn SelectionStrategy> = Arc::<RoundRobin>::clone(&strategy);
        let retirement = ServerRetirement::new(Arc::clone(&metrics), Arc::clone(&failovers), shared);
        let server_id = ServerId::new("gone").expect("valid id");
        let tool = ToolName::new("solo").expect("valid tool");
        metrics.record(&server_id, &tool, Duration::from_millis(2), CallOutcome::Success);
        failovers.record(&server_id);
        assert!(strategy.select(&[], &tool, &SelectionContext::first()).is_none());
        assert_eq!(strategy.tracked_tools(), 1);

        retirement.retire(&Departure {
            server_id: server_id.clone(),
            retired_tools: vec![tool.clone()],
        });

        let snapshot = metrics.snapshot();
        assert!(!snapshot.servers.contains_key(&server_id));
        assert!(!snapshot.tools.contains_key(&tool));
        assert!(failovers.counts().is_empty());
        assert_eq!(strategy.tracked_tools(), 0);
    }
}
