//! Server status state machine.

use super::ParseServerStatusError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness status of a registered tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Registered and awaiting its first probe.
    Registering,
    /// Healthy and preferred for selection.
    Active,
    /// Failing probes; selected only when no active provider exists.
    Degraded,
    /// Persistently failing; kept for inspection, never selected.
    Inactive,
}

impl ServerStatus {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Inactive => "inactive",
        }
    }

    /// Returns whether a server in this status may be handed to a caller.
    #[must_use]
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// Returns whether a registration for the same id may replace a record in
    /// this status.
    #[must_use]
    pub const fn is_replaceable(self) -> bool {
        matches!(self, Self::Inactive)
    }

    /// Computes the status that follows a probe.
    ///
    /// `consecutive_failures` is the failure counter after the probe has been
    /// counted. Any success returns the server to [`ServerStatus::Active`].
    #[must_use]
    pub const fn after_probe(
        self,
        succeeded: bool,
        consecutive_failures: u32,
        thresholds: HealthThresholds,
    ) -> Self {
        if succeeded {
            return Self::Active;
        }

        match self {
            Self::Registering => Self::Degraded,
            Self::Active => {
                if consecutive_failures >= thresholds.degrade_after {
                    Self::Degraded
                } else {
                    Self::Active
                }
            }
            Self::Degraded => {
                if consecutive_failures >= thresholds.inactive_after() {
                    Self::Inactive
                } else {
                    Self::Degraded
                }
            }
            Self::Inactive => Self::Inactive,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ServerStatus {
    type Error = ParseServerStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "registering" => Ok(Self::Registering),
            "active" => Ok(Self::Active),
            "degraded" => Ok(Self::Degraded),
            "inactive" => Ok(Self::Inactive),
            _ => Err(ParseServerStatusError(value.to_owned())),
        }
    }
}

/// Consecutive-failure thresholds driving status degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Failures that move an active server to degraded (k1).
    pub degrade_after: u32,
    /// Further failures that move a degraded server to inactive (k2).
    pub deactivate_after: u32,
}

impl HealthThresholds {
    /// Creates thresholds from k1 and k2.
    #[must_use]
    pub const fn new(degrade_after: u32, deactivate_after: u32) -> Self {
        Self {
            degrade_after,
            deactivate_after,
        }
    }

    /// Total consecutive failures at which a server becomes inactive.
    #[must_use]
    pub const fn inactive_after(self) -> u32 {
        self.degrade_after.saturating_add(self.deactivate_after)
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::new(3, 3)
    }
}
