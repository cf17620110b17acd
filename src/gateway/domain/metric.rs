//! Invocation outcome, per-request metric and windowed aggregate types.

use super::{ServerId, ToolName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Outcome of one invocation attempt against one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The tool returned a result.
    Success,
    /// The deadline elapsed before a reply arrived.
    Timeout,
    /// The transport failed (connect, I/O, framing).
    TransportError,
    /// The tool ran and reported an error, or rejected its arguments.
    ApplicationError,
}

impl CallOutcome {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::TransportError => "transport_error",
            Self::ApplicationError => "application_error",
        }
    }

    /// Returns whether the outcome should be retried on another provider.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::TransportError)
    }

    /// Returns whether the outcome counts as an error.
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One recorded invocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetric {
    /// When the attempt completed.
    pub timestamp: DateTime<Utc>,
    /// Provider that served the attempt.
    pub server_id: ServerId,
    /// Tool that was invoked.
    pub tool: ToolName,
    /// Wall time of the attempt.
    pub latency: Duration,
    /// How the attempt ended.
    pub outcome: CallOutcome,
}

/// Aggregates computed over one rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregate {
    /// Entries currently in the window.
    pub requests: u64,
    /// Successful entries in the window.
    pub successes: u64,
    /// Timed-out entries in the window.
    pub timeouts: u64,
    /// Transport failures in the window.
    pub transport_errors: u64,
    /// Application failures in the window.
    pub application_errors: u64,
    /// Fraction of window entries that failed, in `[0, 1]`.
    pub error_rate: f64,
    /// Mean latency over the window.
    pub mean_latency: Duration,
    /// Median latency over the window.
    pub p50_latency: Duration,
    /// 95th percentile latency over the window.
    pub p95_latency: Duration,
    /// 99th percentile latency over the window.
    pub p99_latency: Duration,
    /// Entries ever recorded for the key, including evicted ones.
    pub lifetime_requests: u64,
    /// Window entry counts split by the other dimension: providers for a
    /// tool key, tools for a server key.
    pub breakdown: BTreeMap<String, u64>,
}

/// Point-in-time view of every rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Capacity of each per-key window.
    pub window_capacity: usize,
    /// Writes dropped because a shard was contended.
    pub dropped_writes: u64,
    /// Aggregates per server.
    pub servers: BTreeMap<ServerId, WindowAggregate>,
    /// Aggregates per tool.
    pub tools: BTreeMap<ToolName, WindowAggregate>,
}

impl MetricsSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub const fn empty(taken_at: DateTime<Utc>, window_capacity: usize) -> Self {
        Self {
            taken_at,
            window_capacity,
            dropped_writes: 0,
            servers: BTreeMap::new(),
            tools: BTreeMap::new(),
        }
    }

    /// Total entries across all server windows.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.servers
            .values()
            .map(|aggregate| aggregate.requests)
            .sum()
    }
}
