//! Notifications published to gateway subscribers.

use super::{AnomalyEvent, OptimizationSuggestion, ServerId, StatusTransition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event published by the gateway to its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum GatewayEvent {
    /// A probe moved a server between statuses.
    StatusChanged(StatusTransition),
    /// A server left the registry without an explicit deregistration.
    ServerEvicted {
        /// Evicted server.
        server_id: ServerId,
        /// When it was evicted.
        at: DateTime<Utc>,
    },
    /// A sustained metric deviation was detected.
    Anomaly(AnomalyEvent),
    /// A rebalancing proposal was produced.
    Optimization(OptimizationSuggestion),
}
