//! Authorization for actions that legitimately create items.

use mdstash_core::{ItemId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Why items are being added from outside the slot system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerAction {
    /// Picked up a dropped item from the world.
    Pickup {
        /// Dropped-item entity id.
        entity_id: u64,
    },
    /// Output of a crafting recipe.
    Craft {
        /// Recipe identifier.
        recipe_id: String,
    },
    /// Harvested from a block or creature.
    Harvest,
}

/// Maximum gain per item id that one producer call may introduce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerGrant {
    allowances: BTreeMap<ItemId, u32>,
}

impl ProducerGrant {
    /// No gain allowed; used for every ordinary click.
    pub fn none() -> Self {
        Self::default()
    }

    /// Allow up to `amount` of a single item.
    pub fn single(item_id: ItemId, amount: u32) -> Self {
        let mut grant = Self::default();
        grant.allow(item_id, amount);
        grant
    }

    /// Add allowance for `item_id`.
    pub fn allow(&mut self, item_id: ItemId, amount: u32) {
        let entry = self.allowances.entry(item_id).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    /// Allowed gain for `item_id`.
    pub fn allowance(&self, item_id: ItemId) -> u32 {
        self.allowances.get(&item_id).copied().unwrap_or(0)
    }

    /// Returns true when nothing may be created.
    pub fn is_empty(&self) -> bool {
        self.allowances.values().all(|amount| *amount == 0)
    }
}

/// External system allowed to add items beyond the conservation bound.
pub trait Producer: Send + Sync {
    /// Declare the maximum output of one producer call.
    fn authorize(&self, session: SessionId, action: &ProducerAction) -> ProducerGrant;
}

/// Producer that never authorizes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Producer for DenyAll {
    fn authorize(&self, _session: SessionId, _action: &ProducerAction) -> ProducerGrant {
        ProducerGrant::none()
    }
}
