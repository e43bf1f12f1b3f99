//! Private per-session inventory.
//!
//! 36 slots addressed as one location: quickbar `0..9`, primary `9..36`.
//! The inventory also owns the cursor used for clicks on its own slots.

use crate::ledger::{validate, Place, Transaction, ValidationFailure};
use crate::persist::Snapshot;
use crate::producer::ProducerGrant;
use crate::slots::SlotArray;
use crate::transact::{click, settle_overflow, ClickError, Commit};
use mdstash_core::{ActionKind, ItemCatalog, ItemId, Stack};
use tracing::warn;

/// Number of quickbar slots.
pub const QUICKBAR_SIZE: usize = 9;

/// Number of primary slots (3 rows × 9 columns).
pub const PRIMARY_SIZE: usize = 27;

/// Number of slots in a player inventory.
pub const INVENTORY_SIZE: usize = QUICKBAR_SIZE + PRIMARY_SIZE;

/// Player inventory with quickbar, primary slots and the inventory cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    slots: SlotArray,
    cursor: Stack,
    overflow: Vec<Stack>,
}

impl Inventory {
    /// Create a new empty inventory.
    pub fn new() -> Self {
        Self {
            slots: SlotArray::new(INVENTORY_SIZE),
            cursor: Stack::EMPTY,
            overflow: Vec::new(),
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_snapshot(snapshot: &Snapshot, catalog: &dyn ItemCatalog) -> Self {
        let restored = snapshot.restore(INVENTORY_SIZE, catalog);
        if restored.dropped > 0 {
            warn!(dropped = restored.dropped, "inventory snapshot had invalid entries");
        }
        let mut inventory = Self {
            slots: SlotArray::from_stacks(restored.slots),
            cursor: Stack::EMPTY,
            overflow: restored.overflow,
        };
        settle_overflow(&mut inventory.slots, &mut inventory.overflow, catalog);
        inventory
    }

    /// All slots, quickbar first.
    pub fn slots(&self) -> &[Stack] {
        self.slots.as_slice()
    }

    /// Quickbar slots.
    pub fn quickbar(&self) -> &[Stack] {
        &self.slots.as_slice()[..QUICKBAR_SIZE]
    }

    /// Primary slots.
    pub fn primary(&self) -> &[Stack] {
        &self.slots.as_slice()[QUICKBAR_SIZE..]
    }

    /// Get the stack in a slot.
    pub fn get(&self, slot: usize) -> Option<Stack> {
        self.slots.get(slot)
    }

    /// Stack currently held on the inventory cursor.
    pub fn cursor(&self) -> Stack {
        self.cursor
    }

    /// Stacks waiting for free space.
    pub fn overflow(&self) -> &[Stack] {
        &self.overflow
    }

    /// Count the total number of a specific item in the slots.
    pub fn count_item(&self, item_id: ItemId) -> u64 {
        self.slots.count_item(item_id)
    }

    /// Check if the inventory holds nothing (slots, cursor and overflow).
    pub fn is_empty(&self) -> bool {
        self.slots.as_slice().iter().all(Stack::is_empty)
            && self.cursor.is_empty()
            && self.overflow.is_empty()
    }

    /// Click one of the inventory's own slots.
    pub fn click(
        &mut self,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
        catalog: &dyn ItemCatalog,
    ) -> Result<Commit, ClickError> {
        let mut commit = click(&mut self.slots, &mut self.cursor, slot, kind, quantity, catalog)?;
        if !commit.is_noop() {
            self.settle(&mut commit.changes, catalog);
        }
        Ok(commit)
    }

    /// Deposit producer output using the same merge rules as a click.
    ///
    /// Returns how much didn't fit and the changed slots.
    pub fn add_item(
        &mut self,
        item_id: ItemId,
        count: u32,
        grant: &ProducerGrant,
        catalog: &dyn ItemCatalog,
    ) -> Result<(u32, Vec<(usize, Stack)>), ValidationFailure> {
        let (writes, leftover) = self.slots.plan_deposit(Stack::new(item_id, count), catalog);
        let mut tx = Transaction::new();
        tx.touch_slots(&writes);
        validate(&tx, grant, catalog)?;
        Ok((leftover.count, self.slots.apply(&writes)))
    }

    /// Consume exactly `count` of `item_id`, or nothing at all.
    pub fn remove_item(
        &mut self,
        item_id: ItemId,
        count: u32,
        catalog: &dyn ItemCatalog,
    ) -> Option<Vec<(usize, Stack)>> {
        let writes = self.slots.plan_remove(item_id, count)?;
        let mut tx = Transaction::new();
        tx.touch_slots(&writes);
        validate(&tx, &ProducerGrant::none(), catalog).ok()?;
        Some(self.slots.apply(&writes))
    }

    /// Take in a stack handed over from another location (a container
    /// cursor being drained). Returns the part that didn't fit.
    pub fn absorb(
        &mut self,
        stack: Stack,
        catalog: &dyn ItemCatalog,
    ) -> Result<(Stack, Vec<(usize, Stack)>), ValidationFailure> {
        let (writes, leftover) = self.slots.plan_deposit(stack, catalog);
        let mut tx = Transaction::new();
        tx.touch_slots(&writes).touch(Place::Transfer, stack, leftover);
        validate(&tx, &ProducerGrant::none(), catalog)?;
        Ok((leftover, self.slots.apply(&writes)))
    }

    /// Put the cursor back into the slots before teardown. Whatever doesn't
    /// fit is kept in overflow so it is persisted rather than lost.
    pub fn drain_cursor(&mut self, catalog: &dyn ItemCatalog) -> Vec<(usize, Stack)> {
        let held = self.cursor.take();
        if held.is_empty() {
            return Vec::new();
        }
        match self.absorb(held, catalog) {
            Ok((leftover, changes)) => {
                if !leftover.is_empty() {
                    warn!(item_id = leftover.item_id, count = leftover.count, "inventory full, cursor kept in overflow");
                    self.overflow.push(leftover);
                }
                changes
            }
            Err(failure) => {
                warn!(%failure, "cursor drain rejected, keeping stack in overflow");
                self.overflow.push(held);
                Vec::new()
            }
        }
    }

    /// Persistable view (the cursor is never persisted; drain it first).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(self.slots.as_slice(), &self.overflow)
    }

    fn settle(&mut self, changes: &mut Vec<(usize, Stack)>, catalog: &dyn ItemCatalog) {
        if self.overflow.is_empty() {
            return;
        }
        for (index, stack) in settle_overflow(&mut self.slots, &mut self.overflow, catalog) {
            match changes.iter_mut().find(|(i, _)| *i == index) {
                Some(existing) => existing.1 = stack,
                None => changes.push((index, stack)),
            }
        }
        changes.sort_by_key(|(index, _)| *index);
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}
