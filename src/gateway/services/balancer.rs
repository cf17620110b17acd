//! Provider selection strategies and failover bookkeeping.

use crate::gateway::domain::{ServerId, ServerRecord, ServerStatus, ToolName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Per-call information handed to a strategy.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Zero-based attempt number within one invocation.
    pub attempt: u32,
    /// Providers already tried by this invocation.
    pub tried: &'a [ServerId],
}

impl<'a> SelectionContext<'a> {
    /// Context for the first attempt of an invocation.
    #[must_use]
    pub const fn first() -> Self {
        Self {
            attempt: 0,
            tried: &[],
        }
    }

    /// Context for a retry after `tried` have failed.
    #[must_use]
    pub const fn retry(attempt: u32, tried: &'a [ServerId]) -> Self {
        Self { attempt, tried }
    }
}

/// Pluggable provider selection.
///
/// `candidates` are the currently eligible providers of `tool`, ordered by
/// id, with already-tried providers removed. Implementations must be safe
/// under concurrent selection for the same tool.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Returns the strategy's configuration name.
    fn name(&self) -> &'static str;

    /// Picks one provider, or `None` when `candidates` is empty.
    fn select(
        &self,
        candidates: &[ServerRecord],
        tool: &ToolName,
        context: &SelectionContext<'_>,
    ) -> Option<ServerId>;

    /// Drops per-server state kept for `server_id`.
    fn forget_server(&self, _server_id: &ServerId) {}

    /// Drops per-tool state kept for `tool`.
    fn forget_tool(&self, _tool: &ToolName) {}
}

/// Returns the active candidates, or every candidate when none is active.
fn preferred_tier(candidates: &[ServerRecord]) -> Vec<&ServerRecord> {
    let active: Vec<&ServerRecord> = candidates
        .iter()
        .filter(|record| record.status() == ServerStatus::Active)
        .collect();
    if active.is_empty() {
        candidates.iter().collect()
    } else {
        active
    }
}

/// Rotating per-tool cursor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: RwLock<HashMap<ToolName, Arc<AtomicUsize>>>,
}

impl RoundRobin {
    /// Creates a strategy with no cursors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many tools currently hold a cursor.
    #[must_use]
    pub fn tracked_tools(&self) -> usize {
        self.cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn cursor(&self, tool: &ToolName) -> Arc<AtomicUsize> {
        if let Some(cursor) = self
            .cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
        {
            return Arc::clone(cursor);
        }
        Arc::clone(
            self.cursors
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(tool.clone())
                .or_default(),
        )
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        StrategyKind::RoundRobin.as_str()
    }

    fn select(
        &self,
        candidates: &[ServerRecord],
        tool: &ToolName,
        _context: &SelectionContext<'_>,
    ) -> Option<ServerId> {
        let turn = self.cursor(tool).fetch_add(1, Ordering::Relaxed);
        let slot = turn.checked_rem(candidates.len())?;
        candidates.get(slot).map(|record| record.id().clone())
    }

    fn forget_tool(&self, tool: &ToolName) {
        self.cursors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool);
    }
}

/// Smooth weighted round-robin over the preferred health tier.
///
/// Degraded candidates are only considered when no candidate is active.
/// Within the tier, each provider is picked in proportion to its effective
/// weight, interleaved rather than in bursts.
#[derive(Debug, Default)]
pub struct HealthWeighted {
    credit: Mutex<HashMap<ToolName, HashMap<ServerId, i64>>>,
}

impl HealthWeighted {
    /// Creates a strategy with no accumulated credit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many servers hold credit for `tool`.
    #[must_use]
    pub fn tracked_servers(&self, tool: &ToolName) -> usize {
        self.credit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .map_or(0, HashMap::len)
    }
}

impl SelectionStrategy for HealthWeighted {
    fn name(&self) -> &'static str {
        StrategyKind::HealthWeighted.as_str()
    }

    fn select(
        &self,
        candidates: &[ServerRecord],
        tool: &ToolName,
        _context: &SelectionContext<'_>,
    ) -> Option<ServerId> {
        let tier = preferred_tier(candidates);
        let total: i64 = tier
            .iter()
            .map(|record| i64::from(record.weight()))
            .fold(0, i64::saturating_add);

        let mut credit = self.credit.lock().unwrap_or_else(PoisonError::into_inner);
        let balances = credit.entry(tool.clone()).or_default();

        let mut best: Option<(&ServerId, i64)> = None;
        for record in tier {
            let balance = balances.entry(record.id().clone()).or_default();
            *balance = balance.saturating_add(i64::from(record.weight()));
            if best.is_none_or(|(_, leading)| *balance > leading) {
                best = Some((record.id(), *balance));
            }
        }

        let (chosen, _) = best?;
        if let Some(balance) = balances.get_mut(chosen) {
            *balance = balance.saturating_sub(total);
        }
        Some(chosen.clone())
    }

    fn forget_server(&self, server_id: &ServerId) {
        let mut credit = self.credit.lock().unwrap_or_else(PoisonError::into_inner);
        for balances in credit.values_mut() {
            balances.remove(server_id);
        }
    }

    fn forget_tool(&self, tool: &ToolName) {
        self.credit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool);
    }
}


/// Lowest latency estimate within the preferred health tier.
///
/// Providers without an estimate yet are tried first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLatency;

impl SelectionStrategy for LeastLatency {
    fn name(&self) -> &'static str {
        StrategyKind::LeastLatency.as_str()
    }

    fn select(
        &self,
        candidates: &[ServerRecord],
        _tool: &ToolName,
        _context: &SelectionContext<'_>,
    ) -> Option<ServerId> {
        preferred_tier(candidates)
            .into_iter()
            .min_by_key(|record| record.latency_ewma().unwrap_or(Duration::ZERO))
            .map(|record| record.id().clone())
    }
}

/// Error returned when parsing an unknown strategy name.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown selection strategy: {0}")]
pub struct ParseStrategyError(pub String);

/// Built-in selection strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// [`RoundRobin`].
    #[default]
    RoundRobin,
    /// [`HealthWeighted`].
    HealthWeighted,
    /// [`LeastLatency`].
    LeastLatency,
}

impl StrategyKind {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::HealthWeighted => "health_weighted",
            Self::LeastLatency => "least_latency",
        }
    }

    /// Builds a fresh strategy instance.
    #[must_use]
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobin::new()),
            Self::HealthWeighted => Arc::new(HealthWeighted::new()),
            Self::LeastLatency => Arc::new(LeastLatency),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for StrategyKind {
    type Error = ParseStrategyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "health_weighted" => Ok(Self::HealthWeighted),
            "least_latency" => Ok(Self::LeastLatency),
            _ => Err(ParseStrategyError(value.to_owned())),
        }
    }
}

/// Load balancer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Strategy used to pick a provider.
    pub strategy: StrategyKind,
    /// Upper bound on providers tried per invocation.
    pub max_attempts: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            max_attempts: 3,
        }
    }
}

/// Count of invocations that failed over away from each server.
#[derive(Debug, Default)]
pub struct FailoverLedger {
    counts: Mutex<HashMap<ServerId, u64>>,
}

impl FailoverLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes that a call abandoned `server_id` for another provider.
    pub fn record(&self, server_id: &ServerId) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(server_id.clone()).or_default();
        *count = count.saturating_add(1);
    }

    /// Returns the failover count of every server that has one.
    #[must_use]
    pub fn counts(&self) -> HashMap<ServerId, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forgets the count of `server_id`.
    pub fn reset(&self, server_id: &ServerId) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
    }
}
