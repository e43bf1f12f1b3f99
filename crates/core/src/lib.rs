#![warn(missing_docs)]
//! Core primitives shared across the workspace: stacks, the item catalog,
//! click resolution and the identifiers that address inventories and
//! containers.

pub mod action;
pub mod catalog;
pub mod stack;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use action::{resolve, ActionKind, Resolution};
pub use catalog::{CatalogError, ItemCatalog, ItemInfo, StaticCatalog, DEFAULT_CAPACITY};
pub use stack::{ItemId, Stack, EMPTY_ITEM};

/// Identifier of a connected player session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// World position of a shared container block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerKey {
    /// Block X coordinate.
    pub x: i32,
    /// Block Y coordinate.
    pub y: i32,
    /// Block Z coordinate.
    pub z: i32,
}

impl ContainerKey {
    /// Create a key from block coordinates.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.x, self.y, self.z)
    }
}

/// Slot set an action addresses.
///
/// `Inventory` always means the acting session's own inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocationId {
    /// The session's private inventory.
    Inventory,
    /// A shared world container.
    Container(ContainerKey),
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationId::Inventory => write!(f, "inventory"),
            LocationId::Container(key) => write!(f, "container@{key}"),
        }
    }
}
