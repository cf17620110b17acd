//! Advisory anomaly detection and pool-balance optimization.
//!
//! Both consumers read metric snapshots and emit immutable records. The
//! only state they may change is a server's effective weight, and only when
//! a collaborator has switched auto-apply on.

use super::{FailoverLedger, ServerFilter, ServerRegistry};
use crate::config::duration_ms;
use crate::gateway::domain::{
    AnomalyEvent, AnomalyEvidence, AnomalyKind, InsightId, MetricScope, MetricsSnapshot,
    OptimizationSuggestion, ServerId, ServerRecord, ServerStatus, Severity, SuggestedAction,
    ToolName, WindowAggregate,
};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on a proposed selection weight.
const MAX_PROPOSED_WEIGHT: u64 = 10_000;

/// Anomaly detector and optimizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightsConfig {
    /// Delay between evaluations.
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// Deviation from the baseline mean, in standard deviations, that
    /// counts as anomalous.
    pub sigma_threshold: f64,
    /// Evaluations kept in each trailing baseline.
    pub baseline_windows: usize,
    /// Baseline evaluations required before detection starts.
    pub min_baseline_samples: usize,
    /// Consecutive deviating evaluations required to emit an event.
    pub sustain_evaluations: u32,
    /// Relative gap between observed and capacity share that triggers a
    /// weight suggestion.
    pub skew_tolerance: f64,
    /// Window requests a tool needs before its balance is judged.
    pub min_skew_samples: u64,
    /// Failovers away from one server that trigger a replacement
    /// suggestion.
    pub failover_threshold: u64,
    /// Records retained per feed.
    pub history_limit: usize,
    /// Whether weight suggestions are applied as they are produced.
    pub auto_apply: bool,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            sigma_threshold: 3.0,
            baseline_windows: 12,
            min_baseline_samples: 4,
            sustain_evaluations: 2,
            skew_tolerance: 0.5,
            min_skew_samples: 20,
            failover_threshold: 5,
            history_limit: 256,
            auto_apply: false,
        }
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "request counts far below 2^52 convert exactly"
)]
const fn as_f64(value: u64) -> f64 {
    value as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Signal {
    ErrorRate,
    RequestRate,
}

impl Signal {
    /// Smallest standard deviation used when scoring, so a perfectly flat
    /// baseline does not turn any change into an infinite deviation.
    #[expect(clippy::float_arithmetic, reason = "relative floor of the mean")]
    fn std_dev_floor(self, mean: f64) -> f64 {
        match self {
            Self::ErrorRate => 0.01,
            Self::RequestRate => (mean.abs() * 0.05).max(1.0),
        }
    }

    const fn kind(self, above_baseline: bool) -> Option<AnomalyKind> {
        match (self, above_baseline) {
            (Self::ErrorRate, true) => Some(AnomalyKind::ErrorRateSpike),
            (Self::ErrorRate, false) => None,
            (Self::RequestRate, true) => Some(AnomalyKind::TrafficSurge),
            (Self::RequestRate, false) => Some(AnomalyKind::TrafficDrop),
        }
    }
}

/// Baseline statistics and the deviation of the latest value.
#[derive(Debug, Clone, Copy)]
struct Deviation {
    mean: f64,
    std_dev: f64,
    sigmas: f64,
}

#[expect(
    clippy::float_arithmetic,
    reason = "moving average and variance over real-valued samples"
)]
fn score(baseline: &VecDeque<f64>, value: f64, signal: Signal) -> Deviation {
    let count = as_f64(u64::try_from(baseline.len()).unwrap_or(u64::MAX)).max(1.0);
    let mean = baseline.iter().sum::<f64>() / count;
    let variance = baseline
        .iter()
        .map(|sample| (sample - mean).powi(2))
        .sum::<f64>()
        / count;
    let std_dev = variance.sqrt();
    let effective = std_dev.max(signal.std_dev_floor(mean));
    Deviation {
        mean,
        std_dev,
        sigmas: (value - mean) / effective,
    }
}

/// Trailing baseline and deviation streak for one signal of one key.
#[derive(Debug, Default)]
struct SignalTracker {
    baseline: VecDeque<f64>,
    streak: u32,
}

impl SignalTracker {
    /// Scores `value` and returns the deviation when it completes a
    /// sustained excursion. Deviating values stay out of the baseline.
    fn observe(
        &mut self,
        value: f64,
        signal: Signal,
        config: &InsightsConfig,
    ) -> Option<(AnomalyKind, Deviation)> {
        if self.baseline.len() < config.min_baseline_samples.max(1) {
            self.push(value, config.baseline_windows);
            return None;
        }

        let deviation = score(&self.baseline, value, signal);
        let kind = (deviation.sigmas.abs() >= config.sigma_threshold)
            .then(|| signal.kind(deviation.sigmas > 0.0))
            .flatten();

        let Some(anomaly) = kind else {
            self.streak = 0;
            self.push(value, config.baseline_windows);
            return None;
        };

        self.streak = self.streak.saturating_add(1);
        (self.streak == config.sustain_evaluations.max(1)).then_some((anomaly, deviation))
    }

    fn push(&mut self, value: f64, capacity: usize) {
        while self.baseline.len() >= capacity.max(1) {
            self.baseline.pop_front();
        }
        self.baseline.push_back(value);
    }
}

/// Flags sustained deviations of error rate and request rate.
#[derive(Debug, Default)]
pub struct AnomalyDetector {
    config: InsightsConfig,
    trackers: HashMap<(MetricScope, Signal), SignalTracker>,
    previous_lifetime: HashMap<MetricScope, u64>,
}

impl AnomalyDetector {
    /// Creates a detector with empty baselines.
    #[must_use]
    pub fn new(config: InsightsConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Evaluates one snapshot against the trailing baselines.
    ///
    /// Request rate is the number of requests recorded for a key since the
    /// previous evaluation. Keys absent from the snapshot lose their
    /// baselines.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot) -> Vec<AnomalyEvent> {
        let scoped: Vec<(MetricScope, &WindowAggregate)> = snapshot
            .servers
            .iter()
            .map(|(id, aggregate)| (MetricScope::Server(id.clone()), aggregate))
            .chain(
                snapshot
                    .tools
                    .iter()
                    .map(|(name, aggregate)| (MetricScope::Tool(name.clone()), aggregate)),
            )
            .collect();

        self.trackers
            .retain(|(scope, _), _| scoped.iter().any(|(live, _)| live == scope));
        self.previous_lifetime
            .retain(|scope, _| scoped.iter().any(|(live, _)| live == scope));

        let mut events = Vec::new();
        for (scope, aggregate) in scoped {
            let previous = self
                .previous_lifetime
                .insert(scope.clone(), aggregate.lifetime_requests)
                .unwrap_or_default();
            let rate = as_f64(aggregate.lifetime_requests.saturating_sub(previous));

            for (signal, value) in [
                (Signal::ErrorRate, aggregate.error_rate),
                (Signal::RequestRate, rate),
            ] {
                let tracker = self.trackers.entry((scope.clone(), signal)).or_default();
                if let Some((kind, deviation)) = tracker.observe(value, signal, &self.config) {
                    events.push(self.event(&scope, kind, value, deviation, aggregate, snapshot));
                }
            }
        }
        events
    }

    #[expect(clippy::float_arithmetic, reason = "severity bands are sigma multiples")]
    fn event(
        &self,
        scope: &MetricScope,
        kind: AnomalyKind,
        observed: f64,
        deviation: Deviation,
        aggregate: &WindowAggregate,
        snapshot: &MetricsSnapshot,
    ) -> AnomalyEvent {
        let severity = if deviation.sigmas.abs() >= self.config.sigma_threshold * 2.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        AnomalyEvent {
            id: InsightId::new(),
            kind,
            scope: scope.clone(),
            severity,
            evidence: AnomalyEvidence {
                observed,
                baseline_mean: deviation.mean,
                baseline_std_dev: deviation.std_dev,
                deviation_sigmas: deviation.sigmas,
                sustained_for: self.config.sustain_evaluations,
                window: aggregate.clone(),
            },
            detected_at: snapshot.taken_at,
        }
    }
}

/// Proposes weight changes and replacements from pool balance.
#[derive(Debug, Default)]
pub struct Optimizer {
    config: InsightsConfig,
    last_proposals: HashMap<(ServerId, ToolName), u32>,
    reported_failovers: HashMap<ServerId, u64>,
}

/// Traffic share of one provider within a tool's pool.
#[derive(Debug, Clone, Copy)]
struct Share {
    served: u64,
    capacity: u64,
}

impl Optimizer {
    /// Creates an optimizer with no prior proposals.
    #[must_use]
    pub fn new(config: InsightsConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Evaluates pool balance and failover counts.
    ///
    /// A weight suggestion is only repeated when its proposed weight
    /// changes; a replacement suggestion is repeated every further
    /// `failover_threshold` failovers.
    pub fn evaluate<S: BuildHasher>(
        &mut self,
        snapshot: &MetricsSnapshot,
        servers: &[ServerRecord],
        failovers: &HashMap<ServerId, u64, S>,
    ) -> Vec<OptimizationSuggestion> {
        let mut suggestions = Vec::new();
        for (tool, aggregate) in &snapshot.tools {
            if aggregate.requests < self.config.min_skew_samples.max(1) {
                continue;
            }
            let pool: Vec<&ServerRecord> = servers
                .iter()
                .filter(|record| record.status().is_eligible() && record.declares(tool))
                .collect();
            if pool.len() < 2 {
                continue;
            }
            let total_capacity: u64 = pool.iter().map(|record| u64::from(record.capacity())).sum();
            for record in pool {
                let share = Share {
                    served: aggregate
                        .breakdown
                        .get(record.id().as_str())
                        .copied()
                        .unwrap_or_default(),
                    capacity: u64::from(record.capacity()),
                };
                if let Some(suggestion) =
                    self.weight_suggestion(tool, record, share, aggregate.requests, total_capacity, snapshot)
                {
                    suggestions.push(suggestion);
                }
            }
        }

        suggestions.extend(self.replacement_suggestions(servers, failovers, snapshot));
        self.reported_failovers
            .retain(|id, _| servers.iter().any(|record| record.id() == id));
        suggestions
    }

    #[expect(clippy::float_arithmetic, reason = "shares are real-valued fractions")]
    fn weight_suggestion(
        &mut self,
        tool: &ToolName,
        record: &ServerRecord,
        share: Share,
        requests: u64,
        total_capacity: u64,
        snapshot: &MetricsSnapshot,
    ) -> Option<OptimizationSuggestion> {
        let observed = super::metrics::ratio(share.served, requests);
        let expected = super::metrics::ratio(share.capacity, total_capacity);
        if (observed - expected).abs() <= self.config.skew_tolerance * expected {
            self.last_proposals
                .remove(&(record.id().clone(), tool.clone()));
            return None;
        }

        let proposed = proposed_weight(record.weight(), share, requests, total_capacity);
        if proposed == record.weight() {
            return None;
        }
        let key = (record.id().clone(), tool.clone());
        if self.last_proposals.get(&key) == Some(&proposed) {
            return None;
        }
        self.last_proposals.insert(key, proposed);

        let direction = if observed > expected { "overloaded" } else { "underused" };
        Some(OptimizationSuggestion {
            id: InsightId::new(),
            action: SuggestedAction::AdjustWeight {
                server_id: record.id().clone(),
                current_weight: record.weight(),
                proposed_weight: proposed,
            },
            severity: Severity::Info,
            tool: Some(tool.clone()),
            rationale: format!(
                "{} is {direction} for {tool}: served {:.0}% of traffic against a {:.0}% capacity share",
                record.id(),
                observed * 100.0,
                expected * 100.0,
            ),
            observed_share: Some(observed),
            expected_share: Some(expected),
            applied: false,
            suggested_at: snapshot.taken_at,
        })
    }

    fn replacement_suggestions<S: BuildHasher>(
        &mut self,
        servers: &[ServerRecord],
        failovers: &HashMap<ServerId, u64, S>,
        snapshot: &MetricsSnapshot,
    ) -> Vec<OptimizationSuggestion> {
        let threshold = self.config.failover_threshold.max(1);
        let mut suggestions = Vec::new();
        for record in servers {
            let count = failovers.get(record.id()).copied().unwrap_or_default();
            let reported = self
                .reported_failovers
                .get(record.id())
                .copied()
                .unwrap_or_default();
            if count < reported.saturating_add(threshold) {
                continue;
            }
            self.reported_failovers.insert(record.id().clone(), count);

            let severity = if record.status() == ServerStatus::Active {
                Severity::Warning
            } else {
                Severity::Critical
            };
            suggestions.push(OptimizationSuggestion {
                id: InsightId::new(),
                action: SuggestedAction::ReplaceServer {
                    server_id: record.id().clone(),
                },
                severity,
                tool: None,
                rationale: format!(
                    "{} is a repeated failover source ({count} calls moved to other providers); consider replacing it",
                    record.id()
                ),
                observed_share: None,
                expected_share: None,
                applied: false,
                suggested_at: snapshot.taken_at,
            });
        }
        suggestions
    }
}

/// Weight that would bring the observed share to the capacity share,
/// rounded to the nearest integer and kept within `[1, MAX_PROPOSED_WEIGHT]`.
fn proposed_weight(current: u32, share: Share, requests: u64, total_capacity: u64) -> u32 {
    let numerator = u128::from(current)
        .saturating_mul(u128::from(share.capacity))
        .saturating_mul(u128::from(requests));
    let denominator = u128::from(total_capacity).saturating_mul(u128::from(share.served));
    let rounded = if denominator == 0 {
        u128::from(current).saturating_mul(2)
    } else {
        numerator
            .saturating_mul(2)
            .saturating_add(denominator)
            .checked_div(denominator.saturating_mul(2))
            .unwrap_or_default()
    };
    let bounded = rounded.clamp(1, u128::from(MAX_PROPOSED_WEIGHT));
    u32::try_from(bounded).unwrap_or(u32::MAX)
}

/// Records produced by one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsightsReport {
    /// New anomalies.
    pub anomalies: Vec<AnomalyEvent>,
    /// New suggestions, with `applied` set for auto-applied ones.
    pub suggestions: Vec<OptimizationSuggestion>,
}

/// Detector, optimizer and their bounded histories.
#[derive(Debug)]
pub struct InsightsEngine {
    config: InsightsConfig,
    detector: Mutex<AnomalyDetector>,
    optimizer: Mutex<Optimizer>,
    anomalies: Mutex<VecDeque<AnomalyEvent>>,
    suggestions: Mutex<VecDeque<OptimizationSuggestion>>,
    auto_apply: AtomicBool,
}

impl InsightsEngine {
    /// Creates an engine with empty histories.
    #[must_use]
    pub fn new(config: InsightsConfig) -> Self {
        Self {
            config,
            detector: Mutex::new(AnomalyDetector::new(config)),
            optimizer: Mutex::new(Optimizer::new(config)),
            anomalies: Mutex::new(VecDeque::new()),
            suggestions: Mutex::new(VecDeque::new()),
            auto_apply: AtomicBool::new(config.auto_apply),
        }
    }

    /// Returns the engine settings.
    #[must_use]
    pub const fn config(&self) -> &InsightsConfig {
        &self.config
    }

    /// Returns whether weight suggestions are applied automatically.
    #[must_use]
    pub fn auto_apply(&self) -> bool {
        self.auto_apply.load(Ordering::Acquire)
    }

    /// Switches automatic application of weight suggestions.
    pub fn set_auto_apply(&self, enabled: bool) {
        self.auto_apply.store(enabled, Ordering::Release);
        info!(enabled, "insights auto-apply changed");
    }

    /// Returns retained anomalies, oldest first.
    #[must_use]
    pub fn anomalies(&self) -> Vec<AnomalyEvent> {
        self.anomalies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Returns retained suggestions, oldest first.
    #[must_use]
    pub fn suggestions(&self) -> Vec<OptimizationSuggestion> {
        self.suggestions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Evaluates `snapshot` and retains the resulting records.
    ///
    /// With auto-apply on, weight suggestions are written to the registry.
    /// Replacement suggestions are never acted on.
    pub fn evaluate<C>(
        &self,
        snapshot: &MetricsSnapshot,
        registry: &ServerRegistry<C>,
        failovers: &FailoverLedger,
    ) -> InsightsReport
    where
        C: Clock + Send + Sync,
    {
        let anomalies = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(snapshot);
        let servers = registry.list(&ServerFilter::all());
        let mut suggestions = self
            .optimizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(snapshot, &servers, &failovers.counts());

        if self.auto_apply() {
            for suggestion in &mut suggestions {
                suggestion.applied = apply(registry, &suggestion.action);
            }
        }

        for anomaly in &anomalies {
            warn!(
                kind = %anomaly.kind,
                scope = %anomaly.scope,
                sigmas = anomaly.evidence.deviation_sigmas,
                "anomaly detected"
            );
        }
        for suggestion in &suggestions {
            info!(
                server_id = %suggestion.action.server_id(),
                applied = suggestion.applied,
                rationale = %suggestion.rationale,
                "optimization suggested"
            );
        }

        retain(&self.anomalies, &anomalies, self.config.history_limit);
        retain(&self.suggestions, &suggestions, self.config.history_limit);
        InsightsReport {
            anomalies,
            suggestions,
        }
    }
}

fn apply<C>(registry: &ServerRegistry<C>, action: &SuggestedAction) -> bool
where
    C: Clock + Send + Sync,
{
    match action {
        SuggestedAction::AdjustWeight {
            server_id,
            proposed_weight,
            ..
        } => registry.set_weight(server_id, *proposed_weight).is_ok(),
        SuggestedAction::ReplaceServer { .. } => false,
    }
}

fn retain<T: Clone>(history: &Mutex<VecDeque<T>>, records: &[T], limit: usize) {
    let mut retained = history.lock().unwrap_or_else(PoisonError::into_inner);
    retained.extend(records.iter().cloned());
    while retained.len() > limit.max(1) {
        retained.pop_front();
    }
}
