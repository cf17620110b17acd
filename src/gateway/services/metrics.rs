//! Rolling per-server and per-tool invocation metrics.
//!
//! Each key owns a fixed-capacity ring buffer. Keys are spread over a fixed
//! number of shards, each behind its own mutex. The write path only ever
//! `try_lock`s a shard: when the shard is busy the write is dropped and
//! counted instead of making the caller wait.

use crate::gateway::domain::{
    CallOutcome, MetricsSnapshot, RequestMetric, ServerId, ToolName, WindowAggregate,
};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tracing::debug;

/// Metrics collector settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Entries kept per key before the oldest is evicted.
    pub window_capacity: usize,
    /// Number of independently locked shards.
    pub shard_count: usize,
    /// Weight of a new sample in the per-server latency estimate.
    pub ewma_alpha: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_capacity: 1024,
            shard_count: 16,
            ewma_alpha: 0.3,
        }
    }
}

/// Fixed-capacity ring buffer of recent metrics for one key.
#[derive(Debug, Default)]
struct RollingWindow {
    entries: VecDeque<RequestMetric>,
    lifetime: u64,
}

impl RollingWindow {
    fn push(&mut self, metric: RequestMetric, capacity: usize) {
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(metric);
        self.lifetime = self.lifetime.saturating_add(1);
    }

    fn aggregate(&self, counterpart: impl Fn(&RequestMetric) -> String) -> WindowAggregate {
        let mut aggregate = WindowAggregate {
            lifetime_requests: self.lifetime,
            ..WindowAggregate::default()
        };
        let mut latencies: Vec<Duration> = Vec::with_capacity(self.entries.len());
        let mut total = Duration::ZERO;

        for metric in &self.entries {
            aggregate.requests = aggregate.requests.saturating_add(1);
            let bucket = match metric.outcome {
                CallOutcome::Success => &mut aggregate.successes,
                CallOutcome::Timeout => &mut aggregate.timeouts,
                CallOutcome::TransportError => &mut aggregate.transport_errors,
                CallOutcome::ApplicationError => &mut aggregate.application_errors,
            };
            *bucket = bucket.saturating_add(1);
            *aggregate.breakdown.entry(counterpart(metric)).or_default() += 1;
            latencies.push(metric.latency);
            total = total.saturating_add(metric.latency);
        }

        latencies.sort_unstable();
        let failures = aggregate.requests.saturating_sub(aggregate.successes);
        aggregate.error_rate = ratio(failures, aggregate.requests);
        aggregate.mean_latency = u32::try_from(latencies.len())
            .ok()
            .and_then(|count| total.checked_div(count))
            .unwrap_or_default();
        aggregate.p50_latency = percentile(&latencies, 50);
        aggregate.p95_latency = percentile(&latencies, 95);
        aggregate.p99_latency = percentile(&latencies, 99);
        aggregate
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[Duration], percent: usize) -> Duration {
    let rank = sorted.len().saturating_mul(percent).div_ceil(100);
    sorted
        .get(rank.saturating_sub(1))
        .copied()
        .unwrap_or_default()
}

/// Returns `part / whole`, or zero for an empty whole.
#[expect(
    clippy::float_arithmetic,
    clippy::cast_precision_loss,
    reason = "rates are reported as real-valued fractions"
)]
pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}

#[derive(Debug, Default)]
struct MetricShard {
    servers: HashMap<ServerId, RollingWindow>,
    tools: HashMap<ToolName, RollingWindow>,
}

#[derive(Hash)]
enum ShardKey<'a> {
    Server(&'a ServerId),
    Tool(&'a ToolName),
}

/// Sharded ring-buffer metrics collector.
#[derive(Debug)]
pub struct MetricsCollector<C>
where
    C: Clock + Send + Sync,
{
    shards: Vec<Mutex<MetricShard>>,
    hasher: RandomState,
    window_capacity: usize,
    dropped_writes: AtomicU64,
    clock: Arc<C>,
}

impl<C> MetricsCollector<C>
where
    C: Clock + Send + Sync,
{
    /// Creates a collector; zero capacities are raised to one.
    #[must_use]
    pub fn new(config: &MetricsConfig, clock: Arc<C>) -> Self {
        let shards = (0..config.shard_count.max(1))
            .map(|_| Mutex::new(MetricShard::default()))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            window_capacity: config.window_capacity.max(1),
            dropped_writes: AtomicU64::new(0),
            clock,
        }
    }

    /// Returns the per-key window capacity.
    #[must_use]
    pub const fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    /// Returns how many key writes were dropped under contention.
    #[must_use]
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    fn shard_for(&self, key: &ShardKey<'_>) -> Option<&Mutex<MetricShard>> {
        let count = u64::try_from(self.shards.len()).ok()?;
        let slot = self.hasher.hash_one(key).checked_rem(count)?;
        self.shards.get(usize::try_from(slot).ok()?)
    }

    fn try_shard(&self, key: &ShardKey<'_>) -> Option<MutexGuard<'_, MetricShard>> {
        match self.shard_for(key)?.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                self.dropped_writes.fetch_add(1, Ordering::Relaxed);
                debug!("metrics shard busy, dropping write");
                None
            }
        }
    }

    /// Records one invocation attempt stamped with the current time.
    ///
    /// Returns whether both the server and the tool window accepted it.
    pub fn record(
        &self,
        server_id: &ServerId,
        tool: &ToolName,
        latency: Duration,
        outcome: CallOutcome,
    ) -> bool {
        self.record_metric(RequestMetric {
            timestamp: self.clock.utc(),
            server_id: server_id.clone(),
            tool: tool.clone(),
            latency,
            outcome,
        })
    }

    /// Records a prepared metric into its server and tool windows.
    ///
    /// Returns whether both windows accepted it.
    pub fn record_metric(&self, metric: RequestMetric) -> bool {
        let capacity = self.window_capacity;
        let server_written = self
            .try_shard(&ShardKey::Server(&metric.server_id))
            .map(|mut shard| {
                shard
                    .servers
                    .entry(metric.server_id.clone())
                    .or_default()
                    .push(metric.clone(), capacity);
            })
            .is_some();
        let tool_written = self
            .try_shard(&ShardKey::Tool(&metric.tool))
            .map(|mut shard| {
                shard
                    .tools
                    .entry(metric.tool.clone())
                    .or_default()
                    .push(metric, capacity);
            })
            .is_some();
        server_written && tool_written
    }

    /// Forgets all windows of `server_id`.
    pub fn forget_server(&self, server_id: &ServerId) {
        if let Some(shard) = self.shard_for(&ShardKey::Server(server_id)) {
            shard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .servers
                .remove(server_id);
        }
    }

    /// Forgets the window of `tool`.
    pub fn forget_tool(&self, tool: &ToolName) {
        if let Some(shard) = self.shard_for(&ShardKey::Tool(tool)) {
            shard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .tools
                .remove(tool);
        }
    }

    /// Computes aggregates over every current window.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::empty(self.clock.utc(), self.window_capacity);
        let mut servers = BTreeMap::new();
        let mut tools = BTreeMap::new();

        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, window) in &guard.servers {
                servers.insert(
                    id.clone(),
                    window.aggregate(|metric| metric.tool.to_string()),
                );
            }
            for (name, window) in &guard.tools {
                tools.insert(
                    name.clone(),
                    window.aggregate(|metric| metric.server_id.to_string()),
                );
            }
        }

        snapshot.servers = servers;
        snapshot.tools = tools;
        snapshot.dropped_writes = self.dropped_writes();
        snapshot
    }
}
