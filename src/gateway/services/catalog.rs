//! Incrementally maintained tool-to-provider index.

use crate::gateway::domain::{ServerId, ServerRecord, ToolDefinition, ToolDescriptor, ToolName};
use std::collections::{BTreeSet, HashMap};

/// Providers of one tool in registration order.
///
/// The first declaration supplies the description and schema exposed by the
/// catalog until its server leaves.
#[derive(Debug, Clone, Default)]
struct CatalogEntry {
    declarations: Vec<(ServerId, ToolDefinition)>,
}

impl CatalogEntry {
    fn providers(&self) -> impl Iterator<Item = &ServerId> {
        self.declarations.iter().map(|(server_id, _)| server_id)
    }

    fn descriptor(&self, name: &ToolName) -> Option<ToolDescriptor> {
        let (_, definition) = self.declarations.first()?;
        Some(ToolDescriptor {
            name: name.clone(),
            description: definition.description().to_owned(),
            input_schema: definition.input_schema().clone(),
            providers: self.providers().cloned().collect(),
        })
    }
}

/// Map from tool name to the servers declaring it.
///
/// Only the tool names touched by a registration change are re-indexed. A
/// tool name is present exactly while at least one provider declares it.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: HashMap<ToolName, CatalogEntry>,
}

impl ToolCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record` as a provider of each tool it declares.
    pub fn index(&mut self, record: &ServerRecord) {
        for definition in record.tools() {
            let entry = self.entries.entry(definition.name().clone()).or_default();
            if !entry.providers().any(|provider| provider == record.id()) {
                entry
                    .declarations
                    .push((record.id().clone(), definition.clone()));
            }
        }
    }

    /// Removes `record` from every tool it declares and drops emptied tools.
    ///
    /// Returns the names that no provider declares any more.
    pub fn unindex(&mut self, record: &ServerRecord) -> Vec<ToolName> {
        let mut emptied = Vec::new();
        for name in record.tool_names() {
            let Some(entry) = self.entries.get_mut(name) else {
                continue;
            };
            entry
                .declarations
                .retain(|(provider, _)| provider != record.id());
            if entry.declarations.is_empty() {
                self.entries.remove(name);
                emptied.push(name.clone());
            }
        }
        emptied
    }

    /// Returns the providers of `tool`, or `None` when nobody declares it.
    #[must_use]
    pub fn providers(&self, tool: &ToolName) -> Option<BTreeSet<ServerId>> {
        self.entries
            .get(tool)
            .map(|entry| entry.providers().cloned().collect())
    }

    /// Returns whether any provider declares `tool`.
    #[must_use]
    pub fn contains(&self, tool: &ToolName) -> bool {
        self.entries.contains_key(tool)
    }

    /// Returns the catalog descriptor for `tool`.
    #[must_use]
    pub fn descriptor(&self, tool: &ToolName) -> Option<ToolDescriptor> {
        self.entries.get(tool)?.descriptor(tool)
    }

    /// Returns every descriptor ordered by tool name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .entries
            .iter()
            .filter_map(|(name, entry)| entry.descriptor(name))
            .collect();
        descriptors.sort_by(|left, right| left.name.cmp(&right.name));
        descriptors
    }

    /// Returns how many tool names are resolvable.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
