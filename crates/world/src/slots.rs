//! Fixed-length slot arrays shared by inventories and containers.
//!
//! Mutating helpers come in two halves: a pure `plan_*` that reports which
//! slots would change (so the ledger can check the move first) and
//! [`SlotArray::apply`] that commits a plan.

use mdstash_core::{ItemCatalog, ItemId, Stack};
use serde::{Deserialize, Serialize};

/// One slot write: index, value before, value after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWrite {
    /// Slot index.
    pub index: usize,
    /// Authoritative value before the write.
    pub before: Stack,
    /// Value after the write.
    pub after: Stack,
}

/// Ordered, fixed-length sequence of stacks. Indices are stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotArray {
    slots: Vec<Stack>,
}

impl SlotArray {
    /// Create `len` empty slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![Stack::EMPTY; len],
        }
    }

    /// Wrap existing stacks. The length becomes fixed.
    pub fn from_stacks(slots: Vec<Stack>) -> Self {
        Self { slots }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true for a zero-length array.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Get the stack in `index`, if in range.
    pub fn get(&self, index: usize) -> Option<Stack> {
        self.slots.get(index).copied()
    }

    /// Overwrite one slot. Returns false when out of range.
    pub fn set(&mut self, index: usize, stack: Stack) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = stack;
                true
            }
            None => false,
        }
    }

    /// All stacks in slot order.
    pub fn as_slice(&self) -> &[Stack] {
        &self.slots
    }

    /// Count the total number of a specific item.
    pub fn count_item(&self, item_id: ItemId) -> u64 {
        self.slots
            .iter()
            .filter(|stack| stack.item_id == item_id && !stack.is_empty())
            .map(|stack| u64::from(stack.count))
            .sum()
    }

    /// Get the number of empty slots.
    pub fn empty_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_empty()).count()
    }

    /// Plan depositing `stack`, merging with existing stacks first and then
    /// filling the first empty slot. Returns the writes and the leftover.
    pub fn plan_deposit(&self, stack: Stack, catalog: &dyn ItemCatalog) -> (Vec<SlotWrite>, Stack) {
        let mut writes = Vec::new();
        if stack.is_empty() {
            return (writes, Stack::EMPTY);
        }
        let capacity = catalog.capacity(stack.item_id);
        let mut remaining = stack.count;

        // First pass: top up existing stacks.
        for (index, existing) in self.slots.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if existing.can_merge(&stack) && !existing.is_full(capacity) {
                let mut after = *existing;
                remaining = after.add(remaining, capacity);
                writes.push(SlotWrite {
                    index,
                    before: *existing,
                    after,
                });
            }
        }

        // Second pass: empty slots for the remainder.
        for (index, existing) in self.slots.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if existing.is_empty() {
                let placed = remaining.min(capacity);
                remaining -= placed;
                writes.push(SlotWrite {
                    index,
                    before: *existing,
                    after: Stack::new(stack.item_id, placed),
                });
            }
        }

        (writes, stack.with_count(remaining))
    }

    /// Plan removing exactly `amount` of `item_id`. `None` if there isn't enough.
    pub fn plan_remove(&self, item_id: ItemId, amount: u32) -> Option<Vec<SlotWrite>> {
        if u64::from(amount) > self.count_item(item_id) {
            return None;
        }
        let mut remaining = amount;
        let mut writes = Vec::new();
        for (index, existing) in self.slots.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if existing.item_id == item_id && !existing.is_empty() {
                let mut after = *existing;
                remaining -= after.remove(remaining);
                writes.push(SlotWrite {
                    index,
                    before: *existing,
                    after,
                });
            }
        }
        Some(writes)
    }

    /// Commit planned writes, returning the `(index, stack)` changes.
    pub fn apply(&mut self, writes: &[SlotWrite]) -> Vec<(usize, Stack)> {
        writes
            .iter()
            .filter(|write| self.set(write.index, write.after))
            .map(|write| (write.index, write.after))
            .collect()
    }
}
