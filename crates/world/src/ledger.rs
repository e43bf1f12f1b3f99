//! Conservation and capacity check over the stacks one action touched.
//!
//! A [`Transaction`] is built from the authoritative before-values of every
//! touched location and the tentative after-values. [`validate`] compares
//! per-item totals over those entries only, so the cost is proportional to
//! what the action touched, never to the size of the world.

use crate::producer::ProducerGrant;
use crate::slots::SlotWrite;
use mdstash_core::{ItemCatalog, ItemId, Stack};
use std::collections::BTreeMap;
use thiserror::Error;

/// Where a touched stack lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// A slot in the inventory or container being mutated.
    Slot(usize),
    /// The acting session's cursor.
    Cursor,
    /// A stack handed in from (or back to) another location.
    Transfer,
    /// The location's overflow holding area.
    Overflow,
}

/// One touched stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touched {
    /// Location of the stack.
    pub place: Place,
    /// Authoritative value before the action.
    pub before: Stack,
    /// Tentative value after the action.
    pub after: Stack,
}

/// Set of touched stacks for one action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    entries: Vec<Touched>,
}

impl Transaction {
    /// Start an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one touched stack.
    pub fn touch(&mut self, place: Place, before: Stack, after: Stack) -> &mut Self {
        self.entries.push(Touched {
            place,
            before,
            after,
        });
        self
    }

    /// Record planned slot writes.
    pub fn touch_slots(&mut self, writes: &[SlotWrite]) -> &mut Self {
        for write in writes {
            self.touch(Place::Slot(write.index), write.before, write.after);
        }
        self
    }

    /// Touched entries in insertion order.
    pub fn entries(&self) -> &[Touched] {
        &self.entries
    }
}

/// Reasons a transaction is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// Total of an item grew beyond what was authorized.
    #[error("item {item_id} total grew from {before} to {after} (allowed gain {allowed_gain})")]
    Conservation {
        /// Item whose total changed.
        item_id: ItemId,
        /// Total before.
        before: u64,
        /// Total after.
        after: u64,
        /// Producer allowance for this item.
        allowed_gain: u64,
    },
    /// A resulting stack exceeds the item's capacity.
    #[error("item {item_id} stack of {count} exceeds capacity {capacity}")]
    OverCapacity {
        /// Offending item.
        item_id: ItemId,
        /// Resulting count.
        count: u32,
        /// Catalog capacity.
        capacity: u32,
    },
    /// A resulting stack breaks the empty-stack invariant.
    #[error("stack {{{item_id}, {count}}} is not canonical")]
    NonCanonical {
        /// Item id of the stack.
        item_id: ItemId,
        /// Count of the stack.
        count: u32,
    },
    /// A resulting stack references an item the catalog doesn't know.
    #[error("unknown item {item_id}")]
    UnknownItem {
        /// Offending item.
        item_id: ItemId,
    },
}

impl ValidationFailure {
    /// Item the failure is about.
    pub fn item_id(&self) -> ItemId {
        match self {
            ValidationFailure::Conservation { item_id, .. }
            | ValidationFailure::OverCapacity { item_id, .. }
            | ValidationFailure::NonCanonical { item_id, .. }
            | ValidationFailure::UnknownItem { item_id } => *item_id,
        }
    }

    /// Signed change in the item's total (0 for shape violations).
    pub fn delta(&self) -> i64 {
        match self {
            ValidationFailure::Conservation { before, after, .. } => *after as i64 - *before as i64,
            _ => 0,
        }
    }
}

#[derive(Default)]
struct Totals {
    before: u64,
    after: u64,
}

/// Accept iff every after-stack is well-formed and, per item, the total did
/// not grow by more than `grant` allows.
pub fn validate(
    tx: &Transaction,
    grant: &ProducerGrant,
    catalog: &dyn ItemCatalog,
) -> Result<(), ValidationFailure> {
    let mut ledger: BTreeMap<ItemId, Totals> = BTreeMap::new();

    for entry in &tx.entries {
        let after = entry.after;
        if !after.is_canonical() {
            return Err(ValidationFailure::NonCanonical {
                item_id: after.item_id,
                count: after.count,
            });
        }
        if !after.is_empty() {
            let info = catalog.lookup(after.item_id);
            if !info.valid {
                return Err(ValidationFailure::UnknownItem {
                    item_id: after.item_id,
                });
            }
            if after.count > info.capacity {
                return Err(ValidationFailure::OverCapacity {
                    item_id: after.item_id,
                    count: after.count,
                    capacity: info.capacity,
                });
            }
            ledger.entry(after.item_id).or_default().after += u64::from(after.count);
        }
        if !entry.before.is_empty() {
            ledger.entry(entry.before.item_id).or_default().before +=
                u64::from(entry.before.count);
        }
    }

    for (&item_id, totals) in &ledger {
        let allowed_gain = u64::from(grant.allowance(item_id));
        if totals.after > totals.before + allowed_gain {
            return Err(ValidationFailure::Conservation {
                item_id,
                before: totals.before,
                after: totals.after,
                allowed_gain,
            });
        }
    }

    Ok(())
}
