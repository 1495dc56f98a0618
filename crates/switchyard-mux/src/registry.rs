//! Aggregated, namespaced tool catalog.

use crate::jsonrpc::ToolDescriptor;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Build the qualified name `{child}_{tool}`.
pub fn qualified_name(child: &str, tool: &str) -> String {
    format!("{child}_{tool}")
}

/// One tool in the aggregated catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub qualified_name: String,
    pub original_name: String,
    pub child: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub metadata: serde_json::Map<String, Value>,
}

impl RegistryEntry {
    fn from_descriptor(child: &str, descriptor: ToolDescriptor) -> Self {
        Self {
            qualified_name: qualified_name(child, &descriptor.name),
            original_name: descriptor.name,
            child: child.to_string(),
            description: descriptor.description,
            input_schema: descriptor.input_schema,
            metadata: descriptor.metadata,
        }
    }

    /// The tool as shown to the gateway's caller: the child's descriptor
    /// with the name replaced by the qualified name.
    pub fn to_catalog_tool(&self) -> CatalogTool<'_> {
        CatalogTool {
            name: &self.qualified_name,
            description: self.description.as_deref(),
            input_schema: &self.input_schema,
            metadata: &self.metadata,
        }
    }
}

/// Serializable view of a [`RegistryEntry`] for `tools/list` replies.
#[derive(Debug, Serialize)]
pub struct CatalogTool<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
    #[serde(rename = "inputSchema")]
    pub input_schema: &'a Value,
    #[serde(flatten)]
    pub metadata: &'a serde_json::Map<String, Value>,
}

/// Mapping from qualified name to entry, kept in registration order.
///
/// A later registration under an existing qualified name replaces the entry
/// in place.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every descriptor reported by `child`. Returns how many
    /// entries were inserted or replaced.
    pub fn register(&mut self, child: &str, descriptors: Vec<ToolDescriptor>) -> usize {
        let count = descriptors.len();
        for descriptor in descriptors {
            let entry = RegistryEntry::from_descriptor(child, descriptor);
            match self.index.get(&entry.qualified_name) {
                Some(&slot) => {
                    let previous = &self.entries[slot];
                    if previous.child != entry.child {
                        tracing::warn!(
                            "Tool '{}' from child '{}' replaces the one from '{}'",
                            entry.qualified_name,
                            entry.child,
                            previous.child
                        );
                    }
                    self.entries[slot] = entry;
                }
                None => {
                    self.index
                        .insert(entry.qualified_name.clone(), self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
        count
    }

    /// Find an entry by qualified name.
    pub fn lookup(&self, qualified_name: &str) -> Option<&RegistryEntry> {
        self.index.get(qualified_name).map(|&slot| &self.entries[slot])
    }

    /// All entries, in registration order.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.entries.clone()
    }

    /// Entries owned by `child`.
    pub fn tools_for(&self, child: &str) -> Vec<&RegistryEntry> {
        self.entries.iter().filter(|e| e.child == child).collect()
    }

    /// Drop every entry owned by `child`. Returns how many were removed.
    pub fn remove_child(&mut self, child: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.child != child);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.index = self
                .entries
                .iter()
                .enumerate()
                .map(|(slot, e)| (e.qualified_name.clone(), slot))
                .collect();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
