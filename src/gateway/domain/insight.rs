//! Advisory anomaly and optimization records.
//!
//! These records are produced from rolling metrics and handed to external
//! collaborators. They never act on the registry by themselves.

use super::{InsightId, ServerId, ToolName, WindowAggregate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal that deviated from its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Error rate rose above the baseline band.
    ErrorRateSpike,
    /// Request rate rose above the baseline band.
    TrafficSurge,
    /// Request rate fell below the baseline band.
    TrafficDrop,
}

impl AnomalyKind {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRateSpike => "error_rate_spike",
            Self::TrafficSurge => "traffic_surge",
            Self::TrafficDrop => "traffic_drop",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How urgently an advisory record deserves attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Worth a look.
    Info,
    /// Outside the expected band.
    Warning,
    /// Far outside the expected band.
    Critical,
}

/// Metric key a record refers to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "key")]
pub enum MetricScope {
    /// A single tool server.
    Server(ServerId),
    /// A tool across all of its providers.
    Tool(ToolName),
}

impl fmt::Display for MetricScope {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(formatter, "server:{id}"),
            Self::Tool(name) => write!(formatter, "tool:{name}"),
        }
    }
}

/// Numbers that justified an anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvidence {
    /// Observed value for the current evaluation.
    pub observed: f64,
    /// Baseline mean.
    pub baseline_mean: f64,
    /// Baseline standard deviation.
    pub baseline_std_dev: f64,
    /// Signed distance from the mean in standard deviations.
    pub deviation_sigmas: f64,
    /// Consecutive evaluations that deviated.
    pub sustained_for: u32,
    /// Window aggregate at detection time.
    pub window: WindowAggregate,
}

/// Immutable record of a sustained deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// Record identifier.
    pub id: InsightId,
    /// What deviated.
    pub kind: AnomalyKind,
    /// Which key deviated.
    pub scope: MetricScope,
    /// How far it deviated.
    pub severity: Severity,
    /// Supporting numbers.
    pub evidence: AnomalyEvidence,
    /// When it was detected.
    pub detected_at: DateTime<Utc>,
}

/// Proposed change to the provider pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum SuggestedAction {
    /// Change a server's selection weight.
    AdjustWeight {
        /// Server to adjust.
        server_id: ServerId,
        /// Weight in effect now.
        current_weight: u32,
        /// Weight that would match its declared capacity share.
        proposed_weight: u32,
    },
    /// Retire or replace a server that keeps triggering failover.
    ReplaceServer {
        /// Server to replace.
        server_id: ServerId,
    },
}

impl SuggestedAction {
    /// Returns the server the action targets.
    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        match self {
            Self::AdjustWeight { server_id, .. } | Self::ReplaceServer { server_id } => server_id,
        }
    }
}

/// Immutable record of a rebalancing proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    /// Record identifier.
    pub id: InsightId,
    /// Proposed action.
    pub action: SuggestedAction,
    /// Urgency.
    pub severity: Severity,
    /// Pool the observation was made in, when tool-specific.
    pub tool: Option<ToolName>,
    /// Human-readable rationale.
    pub rationale: String,
    /// Observed share of the pool's traffic, when relevant.
    pub observed_share: Option<f64>,
    /// Share implied by declared capacity, when relevant.
    pub expected_share: Option<f64>,
    /// Whether the action was applied because auto-apply was enabled.
    pub applied: bool,
    /// When it was produced.
    pub suggested_at: DateTime<Utc>,
}
