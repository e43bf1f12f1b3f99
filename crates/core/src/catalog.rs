//! Item validity and per-item capacity lookup.

use crate::stack::{ItemId, EMPTY_ITEM};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Capacity used by [`StaticCatalog::uniform`] and most data-driven items.
pub const DEFAULT_CAPACITY: u32 = 64;

/// Catalog answer for one item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo {
    /// Maximum count a single stack of this item may hold.
    pub capacity: u32,
    /// Whether the id refers to a known item.
    pub valid: bool,
}

impl ItemInfo {
    /// Answer for ids the catalog does not know.
    pub const UNKNOWN: ItemInfo = ItemInfo {
        capacity: 0,
        valid: false,
    };
}

/// Item lookup consumed by the resolver, validator and snapshot restore.
pub trait ItemCatalog: Send + Sync {
    /// Look up capacity and validity for `item_id`.
    fn lookup(&self, item_id: ItemId) -> ItemInfo;

    /// Capacity shortcut; unknown items have capacity 0.
    fn capacity(&self, item_id: ItemId) -> u32 {
        self.lookup(item_id).capacity
    }
}

/// Errors emitted while loading an item table.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Wrap IO errors when reading item tables.
    #[error("failed to read item table: {0}")]
    Io(#[from] std::io::Error),
    /// Wrap serde parsing issues.
    #[error("failed to parse item table: {0}")]
    Parse(#[from] serde_json::Error),
    /// Table content is inconsistent.
    #[error("invalid item table: {0}")]
    Invalid(String),
}

/// One row of a JSON item table.
#[derive(Debug, Deserialize)]
pub struct ItemDefinition {
    /// Numeric item id (must be non-zero).
    pub id: ItemId,
    /// Human-readable identifier (e.g., "stone").
    #[serde(default)]
    pub name: Option<String>,
    /// Stack capacity; defaults to [`DEFAULT_CAPACITY`].
    #[serde(default)]
    pub capacity: Option<u32>,
}

/// In-memory catalog keyed by item id.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    items: BTreeMap<ItemId, u32>,
}

impl StaticCatalog {
    /// Build from `(id, capacity)` pairs. Id 0 and zero capacities are ignored.
    pub fn new(entries: impl IntoIterator<Item = (ItemId, u32)>) -> Self {
        let items = entries
            .into_iter()
            .filter(|(id, capacity)| *id != EMPTY_ITEM && *capacity > 0)
            .collect();
        Self { items }
    }

    /// Catalog where ids `1..=max_id` are valid with [`DEFAULT_CAPACITY`].
    pub fn uniform(max_id: ItemId) -> Self {
        Self::new((1..=max_id).map(|id| (id, DEFAULT_CAPACITY)))
    }

    /// Parse a JSON item table (`[{"id": 1, "name": "stone", "capacity": 64}]`).
    pub fn from_json_str(input: &str) -> Result<Self, CatalogError> {
        let defs: Vec<ItemDefinition> = serde_json::from_str(input)?;
        let mut items = BTreeMap::new();
        for def in defs {
            if def.id == EMPTY_ITEM {
                return Err(CatalogError::Invalid("item id 0 is reserved".into()));
            }
            let capacity = def.capacity.unwrap_or(DEFAULT_CAPACITY);
            if capacity == 0 {
                return Err(CatalogError::Invalid(format!(
                    "item {} ({}) has zero capacity",
                    def.id,
                    def.name.as_deref().unwrap_or("unnamed")
                )));
            }
            if items.insert(def.id, capacity).is_some() {
                return Err(CatalogError::Invalid(format!("duplicate item id {}", def.id)));
            }
        }
        Ok(Self { items })
    }

    /// Load a JSON item table from disk.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Number of known items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true when no items are registered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl ItemCatalog for StaticCatalog {
    fn lookup(&self, item_id: ItemId) -> ItemInfo {
        match self.items.get(&item_id) {
            Some(&capacity) => ItemInfo {
                capacity,
                valid: true,
            },
            None => ItemInfo::UNKNOWN,
        }
    }
}
