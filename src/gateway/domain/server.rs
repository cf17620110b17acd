//! Tool server registration descriptor and registry record.

use super::{
    Endpoint, GatewayDomainError, HealthThresholds, ServerId, ServerStatus, ToolDefinition,
    ToolName, TransportKind,
};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Registration payload announced by (or on behalf of) a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDescriptor {
    id: ServerId,
    display_name: String,
    endpoint: Endpoint,
    tools: Vec<ToolDefinition>,
    capacity: u32,
}

impl ServerDescriptor {
    /// Creates a descriptor with no declared tools and a capacity of one.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError::EmptyDisplayName`] when the display name
    /// is empty after trimming.
    pub fn new(
        id: ServerId,
        display_name: impl Into<String>,
        endpoint: Endpoint,
    ) -> Result<Self, GatewayDomainError> {
        let trimmed_name = display_name.into().trim().to_owned();
        if trimmed_name.is_empty() {
            return Err(GatewayDomainError::EmptyDisplayName);
        }

        Ok(Self {
            id,
            display_name: trimmed_name,
            endpoint,
            tools: Vec::new(),
            capacity: 1,
        })
    }

    /// Replaces the declared tools.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError::DuplicateToolDeclaration`] when a tool
    /// name appears twice.
    pub fn with_tools(
        mut self,
        tools: impl IntoIterator<Item = ToolDefinition>,
    ) -> Result<Self, GatewayDomainError> {
        let declared: Vec<ToolDefinition> = tools.into_iter().collect();
        let mut seen = HashSet::with_capacity(declared.len());
        for tool in &declared {
            if !seen.insert(tool.name()) {
                return Err(GatewayDomainError::DuplicateToolDeclaration(
                    tool.name().to_string(),
                ));
            }
        }
        self.tools = declared;
        Ok(self)
    }

    /// Sets the declared capacity weight.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayDomainError::ZeroCapacity`] for a zero weight.
    pub fn with_capacity(mut self, capacity: u32) -> Result<Self, GatewayDomainError> {
        if capacity == 0 {
            return Err(GatewayDomainError::ZeroCapacity);
        }
        self.capacity = capacity;
        Ok(self)
    }

    /// Returns the server identifier.
    #[must_use]
    pub const fn id(&self) -> &ServerId {
        &self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the declared tools.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Returns the declared capacity weight.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A status change produced by a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Server whose status changed.
    pub server_id: ServerId,
    /// Status before the probe.
    pub from: ServerStatus,
    /// Status after the probe.
    pub to: ServerStatus,
    /// Failure counter after the probe.
    pub consecutive_failures: u32,
    /// When the probe completed.
    pub at: DateTime<Utc>,
}

/// Registry-owned record of a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    id: ServerId,
    display_name: String,
    endpoint: Endpoint,
    tools: Vec<ToolDefinition>,
    capacity: u32,
    weight: u32,
    status: ServerStatus,
    consecutive_failures: u32,
    last_probe_at: Option<DateTime<Utc>>,
    inactive_since: Option<DateTime<Utc>>,
    latency_ewma: Option<Duration>,
    registered_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Creates a record in [`ServerStatus::Registering`] from a descriptor.
    #[must_use]
    pub fn new(descriptor: ServerDescriptor, clock: &impl Clock) -> Self {
        let ServerDescriptor {
            id,
            display_name,
            endpoint,
            tools,
            capacity,
        } = descriptor;

        Self {
            id,
            display_name,
            endpoint,
            tools,
            capacity,
            weight: capacity,
            status: ServerStatus::Registering,
            consecutive_failures: 0,
            last_probe_at: None,
            inactive_since: None,
            latency_ewma: None,
            registered_at: clock.utc(),
        }
    }

    /// Returns the server identifier.
    #[must_use]
    pub const fn id(&self) -> &ServerId {
        &self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the transport kind.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.endpoint.kind()
    }

    /// Returns the declared tools.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Returns the declared tool names.
    pub fn tool_names(&self) -> impl Iterator<Item = &ToolName> {
        self.tools.iter().map(ToolDefinition::name)
    }

    /// Returns whether the server declares `tool`.
    #[must_use]
    pub fn declares(&self, tool: &ToolName) -> bool {
        self.tools.iter().any(|definition| definition.name() == tool)
    }

    /// Returns the declared capacity weight.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the effective selection weight.
    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> ServerStatus {
        self.status
    }

    /// Returns the consecutive probe failure counter.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns when the server was last probed.
    #[must_use]
    pub const fn last_probe_at(&self) -> Option<DateTime<Utc>> {
        self.last_probe_at
    }

    /// Returns when the server entered [`ServerStatus::Inactive`].
    #[must_use]
    pub const fn inactive_since(&self) -> Option<DateTime<Utc>> {
        self.inactive_since
    }

    /// Returns the exponentially-weighted latency estimate.
    #[must_use]
    pub const fn latency_ewma(&self) -> Option<Duration> {
        self.latency_ewma
    }

    /// Returns the registration timestamp.
    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Applies a probe result and returns the transition it caused, if any.
    pub fn record_probe(
        &mut self,
        succeeded: bool,
        thresholds: HealthThresholds,
        clock: &impl Clock,
    ) -> Option<StatusTransition> {
        let now = clock.utc();
        self.consecutive_failures = if succeeded {
            0
        } else {
            self.consecutive_failures.saturating_add(1)
        };
        self.last_probe_at = Some(now);

        let previous = self.status;
        let next = previous.after_probe(succeeded, self.consecutive_failures, thresholds);
        if previous == next {
            return None;
        }

        self.status = next;
        self.inactive_since = (next == ServerStatus::Inactive).then_some(now);
        Some(StatusTransition {
            server_id: self.id.clone(),
            from: previous,
            to: next,
            consecutive_failures: self.consecutive_failures,
            at: now,
        })
    }

    /// Returns whether the record has been inactive for longer than `ttl`.
    #[must_use]
    pub fn inactive_longer_than(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Some(since) = self.inactive_since else {
            return false;
        };
        chrono::Duration::from_std(ttl).is_ok_and(|limit| now.signed_duration_since(since) > limit)
    }

    /// Folds an observed call latency into the EWMA estimate.
    ///
    /// `alpha` is the weight of the new sample and is clamped to `[0, 1]`.
    #[expect(
        clippy::float_arithmetic,
        reason = "EWMA smoothing is defined over real-valued weights"
    )]
    pub fn observe_latency(&mut self, sample: Duration, alpha: f64) {
        let weight = alpha.clamp(0.0, 1.0);
        self.latency_ewma = Some(self.latency_ewma.map_or(sample, |previous| {
            previous.mul_f64(1.0 - weight) + sample.mul_f64(weight)
        }));
    }

    /// Replaces the effective selection weight (minimum one).
    pub fn set_weight(&mut self, weight: u32) {
        self.weight = weight.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockable::DefaultClock;
    use serde_json::json;

    fn descriptor() -> ServerDescriptor {
        let tool = ToolDefinition::new("echo", "Echoes input", json!({"type": "object"}))
            .expect("valid tool");
        ServerDescriptor::new(
            ServerId::new("s1").expect("valid id"),
            "Echo server",
            Endpoint::http("http://127.0.0.1:9000").expect("valid endpoint"),
        )
        .expect("valid descriptor")
        .with_tools([tool])
        .expect("unique tools")
    }

    #[test]
    fn new_record_starts_registering() {
        let record = ServerRecord::new(descriptor(), &DefaultClock);
        assert_eq!(record.status(), ServerStatus::Registering);
        assert_eq!(record.consecutive_failures(), 0);
        assert_eq!(record.weight(), 1);
        assert!(record.declares(&ToolName::new("echo").expect("valid tool name")));
    }

    #[test]
    fn duplicate_tool_declarations_are_rejected() {
        let tool = ToolDefinition::new("echo", "", json!({})).expect("valid tool");
        let result = descriptor().with_tools([tool.clone(), tool]);
        assert_eq!(
            result,
            Err(GatewayDomainError::DuplicateToolDeclaration("echo".to_owned()))
        );
    }

    #[test]
    fn probes_drive_degradation_and_fast_recovery() {
        let clock = DefaultClock;
        let thresholds = HealthThresholds::new(2, 1);
        let mut record = ServerRecord::new(descriptor(), &clock);

        let promoted = record
            .record_probe(true, thresholds, &clock)
            .expect("registering -> active");
        assert_eq!(promoted.to, ServerStatus::Active);

        assert!(record.record_probe(false, thresholds, &clock).is_none());
        let degraded = record
            .record_probe(false, thresholds, &clock)
            .expect("active -> degraded");
        assert_eq!(degraded.to, ServerStatus::Degraded);

        let inactive = record
            .record_probe(false, thresholds, &clock)
            .expect("degraded -> inactive");
        assert_eq!(inactive.to, ServerStatus::Inactive);
        assert!(record.inactive_since().is_some());

        let recovered = record
            .record_probe(true, thresholds, &clock)
            .expect("inactive -> active");
        assert_eq!(recovered.from, ServerStatus::Inactive);
        assert_eq!(record.consecutive_failures(), 0);
        assert!(record.inactive_since().is_none());
    }

    #[test]
    fn latency_estimate_is_smoothed() {
        let mut record = ServerRecord::new(descriptor(), &DefaultClock);
        record.observe_latency(Duration::from_millis(100), 0.5);
        record.observe_latency(Duration::from_millis(200), 0.5);
        let estimate = record.latency_ewma().expect("estimate recorded");
        assert!(estimate > Duration::from_millis(149) && estimate < Duration::from_millis(151));
    }

    #[test]
    fn inactive_ttl_is_measured_from_inactivation() {
        let clock = DefaultClock;
        let thresholds = HealthThresholds::new(1, 1);
        let mut record = ServerRecord::new(descriptor(), &clock);
        record.record_probe(false, thresholds, &clock);
        record.record_probe(false, thresholds, &clock);
        assert_eq!(record.status(), ServerStatus::Inactive);

        let since = record.inactive_since().expect("inactive timestamp");
        let later = since + chrono::Duration::seconds(61);
        assert!(record.inactive_longer_than(Duration::from_secs(60), later));
        assert!(!record.inactive_longer_than(Duration::from_secs(120), later));
    }
}
