//! Authoritative in-memory registry of tool servers.

use super::catalog::ToolCatalog;
use crate::gateway::domain::{
    GatewayDomainError, HealthThresholds, ServerDescriptor, ServerId, ServerRecord, ServerStatus,
    StatusTransition, ToolDescriptor, ToolName, TransportKind,
};
use mockable::Clock;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors returned by registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A live record already uses the identifier.
    #[error("server {id} is already registered and {status}")]
    Conflict {
        /// Conflicting identifier.
        id: ServerId,
        /// Status of the record that blocked the registration.
        status: ServerStatus,
    },

    /// No record uses the identifier.
    #[error("server {0} is not registered")]
    NotFound(ServerId),

    /// No server declares the tool.
    #[error("no server declares tool {0}")]
    UnknownTool(ToolName),

    /// The descriptor failed validation.
    #[error(transparent)]
    Domain(#[from] GatewayDomainError),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Criteria for [`ServerRegistry::list`]; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    status: Option<ServerStatus>,
    tool: Option<ToolName>,
    transport: Option<TransportKind>,
}

impl ServerFilter {
    /// Creates a filter matching every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts the listing to records in `status`.
    #[must_use]
    pub const fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts the listing to records declaring `tool`.
    #[must_use]
    pub fn with_tool(mut self, tool: ToolName) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Restricts the listing to records reached over `transport`.
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    fn matches(&self, record: &ServerRecord) -> bool {
        self.status.is_none_or(|status| record.status() == status)
            && self
                .transport
                .is_none_or(|transport| record.transport() == transport)
            && self.tool.as_ref().is_none_or(|tool| record.declares(tool))
    }
}

/// A server that left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Identifier of the removed record.
    pub server_id: ServerId,
    /// Tool names that lost their last provider with it.
    pub retired_tools: Vec<ToolName>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    /// Stored record, in [`ServerStatus::Registering`].
    pub record: ServerRecord,
    /// The inactive record with the same id that was replaced, if any.
    pub replaced: Option<Departure>,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<ServerId, ServerRecord>,
    catalog: ToolCatalog,
}

impl RegistryState {
    fn remove(&mut self, id: &ServerId) -> Option<Departure> {
        let record = self.records.remove(id)?;
        let retired_tools = self.catalog.unindex(&record);
        Some(Departure {
            server_id: record.id().clone(),
            retired_tools,
        })
    }
}

/// Server registry with its tool catalog.
///
/// Records and catalog entries change together under one write lock, so a
/// reader never observes a provider that is absent from the records. No I/O
/// happens while the lock is held.
#[derive(Debug)]
pub struct ServerRegistry<C>
where
    C: Clock + Send + Sync,
{
    state: RwLock<RegistryState>,
    clock: Arc<C>,
}

impl<C> ServerRegistry<C>
where
    C: Clock + Send + Sync,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new(clock: Arc<C>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a new record for `descriptor` in [`ServerStatus::Registering`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] when a record with the same id
    /// exists and is not [`ServerStatus::Inactive`].
    pub fn register(&self, descriptor: ServerDescriptor) -> RegistryResult<Registration> {
        let record = ServerRecord::new(descriptor, &*self.clock);
        let mut state = self.write();

        let previous = match state.records.get(record.id()) {
            Some(existing) if !existing.status().is_replaceable() => {
                return Err(RegistryError::Conflict {
                    id: record.id().clone(),
                    status: existing.status(),
                });
            }
            Some(_) => state.remove(record.id()),
            None => None,
        };

        state.catalog.index(&record);
        state.records.insert(record.id().clone(), record.clone());
        drop(state);

        let replaced = previous.map(|mut departure| {
            departure
                .retired_tools
                .retain(|name| !record.declares(name));
            departure
        });
        info!(
            server_id = %record.id(),
            endpoint = %record.endpoint(),
            tools = record.tools().len(),
            replaced = replaced.is_some(),
            "registered tool server"
        );
        Ok(Registration { record, replaced })
    }

    /// Removes a record and its catalog entries.
    ///
    /// Returns `None` when no record used `id`.
    pub fn deregister(&self, id: &ServerId) -> Option<Departure> {
        let departure = self.write().remove(id)?;
        info!(
            server_id = %id,
            retired_tools = departure.retired_tools.len(),
            "deregistered tool server"
        );
        Some(departure)
    }

    /// Returns a copy of the record for `id`.
    #[must_use]
    pub fn get(&self, id: &ServerId) -> Option<ServerRecord> {
        self.read().records.get(id).cloned()
    }

    /// Returns copies of every record matching `filter`, ordered by id.
    #[must_use]
    pub fn list(&self, filter: &ServerFilter) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> = self
            .read()
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by(|left, right| left.id().cmp(right.id()));
        records
    }

    /// Returns how many records are stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Returns the eligible providers of `tool`, ordered by id.
    ///
    /// Active providers are preferred; degraded ones are returned only when
    /// no provider is active. The list is empty when the tool is declared
    /// but nobody is eligible.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTool`] when no server declares `tool`.
    pub fn candidates(&self, tool: &ToolName) -> RegistryResult<Vec<ServerRecord>> {
        let state = self.read();
        let providers = state
            .catalog
            .providers(tool)
            .ok_or_else(|| RegistryError::UnknownTool(tool.clone()))?;

        let eligible: Vec<&ServerRecord> = providers
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|record| record.status().is_eligible())
            .collect();
        let has_active = eligible
            .iter()
            .any(|record| record.status() == ServerStatus::Active);

        Ok(eligible
            .into_iter()
            .filter(|record| !has_active || record.status() == ServerStatus::Active)
            .cloned()
            .collect())
    }

    /// Returns the ids of the eligible providers of `tool`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTool`] when no server declares `tool`.
    pub fn resolve(&self, tool: &ToolName) -> RegistryResult<Vec<ServerId>> {
        Ok(self
            .candidates(tool)?
            .into_iter()
            .map(|record| record.id().clone())
            .collect())
    }

    /// Returns the catalog descriptor for `tool`.
    #[must_use]
    pub fn tool(&self, tool: &ToolName) -> Option<ToolDescriptor> {
        self.read().catalog.descriptor(tool)
    }

    /// Returns every catalog descriptor ordered by tool name.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.read().catalog.descriptors()
    }

    /// Returns how many tool names are resolvable.
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.read().catalog.len()
    }

    /// Applies a probe outcome to the record that was probed.
    ///
    /// The outcome is discarded when the record was deregistered or
    /// replaced while the probe was in flight.
    pub fn apply_probe(
        &self,
        probed: &ServerRecord,
        succeeded: bool,
        thresholds: HealthThresholds,
    ) -> Option<StatusTransition> {
        let mut state = self.write();
        let Some(record) = state.records.get_mut(probed.id()) else {
            debug!(server_id = %probed.id(), "discarding probe for removed server");
            return None;
        };
        if record.registered_at() != probed.registered_at() {
            debug!(server_id = %probed.id(), "discarding probe for replaced server");
            return None;
        }
        record.record_probe(succeeded, thresholds, &*self.clock)
    }

    /// Folds an observed call latency into the record's estimate.
    pub fn observe_latency(&self, id: &ServerId, sample: Duration, alpha: f64) {
        if let Some(record) = self.write().records.get_mut(id) {
            record.observe_latency(sample, alpha);
        }
    }

    /// Replaces the effective selection weight of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when no record uses `id`.
    pub fn set_weight(&self, id: &ServerId, weight: u32) -> RegistryResult<()> {
        let mut state = self.write();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        record.set_weight(weight);
        Ok(())
    }

    /// Removes every record inactive for longer than `ttl`.
    ///
    /// Returns what was evicted, ordered by id.
    pub fn evict_expired(&self, ttl: Duration) -> Vec<Departure> {
        let now = self.clock.utc();
        let mut state = self.write();
        let mut expired: Vec<ServerId> = state
            .records
            .values()
            .filter(|record| record.inactive_longer_than(ttl, now))
            .map(|record| record.id().clone())
            .collect();
        expired.sort();
        expired.iter().filter_map(|id| state.remove(id)).collect()
    }
}
