//! Stack value type and per-pile arithmetic.
//!
//! A [`Stack`] is an `(item_id, count)` pair. Capacity is not stored on the
//! stack; it is a per-item constant supplied by the
//! [`ItemCatalog`](crate::ItemCatalog), so every arithmetic helper that can
//! grow a stack takes the capacity explicitly.

use serde::{Deserialize, Serialize};

/// Item identifier referencing the item catalog. `0` is the empty item.
pub type ItemId = u16;

/// Item id reserved for "nothing in this slot".
pub const EMPTY_ITEM: ItemId = 0;

/// A pile of identical items occupying one slot (or one cursor).
///
/// Invariant: `item_id == 0` exactly when `count == 0`. Constructors
/// normalize so the invariant cannot be broken through this API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Stack {
    /// Item type identifier.
    pub item_id: ItemId,
    /// Number of items in this stack.
    pub count: u32,
}

impl Stack {
    /// The canonical empty stack.
    pub const EMPTY: Stack = Stack {
        item_id: EMPTY_ITEM,
        count: 0,
    };

    /// Create a stack, collapsing to [`Stack::EMPTY`] when either field is zero.
    pub fn new(item_id: ItemId, count: u32) -> Self {
        if item_id == EMPTY_ITEM || count == 0 {
            Self::EMPTY
        } else {
            Self { item_id, count }
        }
    }

    /// Returns true when this stack holds nothing.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check the `item_id == 0 ⇔ count == 0` invariant.
    pub fn is_canonical(&self) -> bool {
        (self.item_id == EMPTY_ITEM) == (self.count == 0)
    }

    /// Same stack with a different count (empty when `count == 0`).
    pub fn with_count(&self, count: u32) -> Self {
        Self::new(self.item_id, count)
    }

    /// Check if this stack can merge with another stack.
    pub fn can_merge(&self, other: &Stack) -> bool {
        !self.is_empty() && self.item_id == other.item_id
    }

    /// Remaining space before `capacity` is reached.
    pub fn room(&self, capacity: u32) -> u32 {
        capacity.saturating_sub(self.count)
    }

    /// Check if this stack is at (or beyond) `capacity`.
    pub fn is_full(&self, capacity: u32) -> bool {
        self.count >= capacity
    }

    /// Try to add items to this stack, returning the amount that didn't fit.
    ///
    /// Adding to an empty stack does nothing; use [`Stack::new`] to start one.
    pub fn add(&mut self, amount: u32, capacity: u32) -> u32 {
        if self.is_empty() {
            return amount;
        }
        let added = amount.min(self.room(capacity));
        self.count += added;
        amount - added
    }

    /// Try to remove items from this stack, returning the amount actually removed.
    pub fn remove(&mut self, amount: u32) -> u32 {
        let removed = amount.min(self.count);
        self.count -= removed;
        if self.count == 0 {
            *self = Self::EMPTY;
        }
        removed
    }

    /// Split off `amount` items into a new stack.
    pub fn split(&mut self, amount: u32) -> Option<Stack> {
        if amount == 0 || amount > self.count {
            return None;
        }
        let item_id = self.item_id;
        self.remove(amount);
        Some(Stack::new(item_id, amount))
    }

    /// Take the whole stack, leaving this one empty.
    pub fn take(&mut self) -> Stack {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_normalizes_empty() {
        assert_eq!(Stack::new(5, 0), Stack::EMPTY);
        assert_eq!(Stack::new(0, 12), Stack::EMPTY);
        assert!(Stack::new(5, 1).is_canonical());
    }

    #[test]
    fn add_respects_capacity() {
        let mut stack = Stack::new(1, 60);
        let leftover = stack.add(10, 64);

        assert_eq!(leftover, 6);
        assert_eq!(stack.count, 64);
        assert!(stack.is_full(64));
    }

    #[test]
    fn remove_to_zero_clears_item() {
        let mut stack = Stack::new(4, 3);
        assert_eq!(stack.remove(10), 3);
        assert_eq!(stack, Stack::EMPTY);
    }

    #[test]
    fn split_rejects_bad_amounts() {
        let mut stack = Stack::new(2, 8);
        assert!(stack.split(0).is_none());
        assert!(stack.split(9).is_none());

        let half = stack.split(4).unwrap();
        assert_eq!(half, Stack::new(2, 4));
        assert_eq!(stack.count, 4);
    }

    #[test]
    fn empty_stacks_never_merge() {
        assert!(!Stack::EMPTY.can_merge(&Stack::EMPTY));
        assert!(Stack::new(3, 1).can_merge(&Stack::new(3, 50)));
        assert!(!Stack::new(3, 1).can_merge(&Stack::new(4, 1)));
    }
}
