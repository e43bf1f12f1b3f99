//! Pure state transition for one click on one slot.
//!
//! [`resolve`] never looks at anything but the clicked stack and the cursor.
//! It computes the *tentative* result; conservation is enforced afterwards by
//! the transaction validator against the authoritative before-state.

use crate::catalog::ItemCatalog;
use crate::stack::Stack;
use serde::{Deserialize, Serialize};

/// Which click was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Pick up, place, merge or swap whole stacks.
    Primary,
    /// Split a stack in half or move single units.
    Secondary,
}

/// Outcome of resolving a click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Stack left in the clicked slot.
    pub target: Stack,
    /// Stack left on the cursor.
    pub cursor: Stack,
    /// False when the click had no effect.
    pub changed: bool,
}

impl Resolution {
    fn unchanged(target: Stack, cursor: Stack) -> Self {
        Self {
            target,
            cursor,
            changed: false,
        }
    }

    fn changed(target: Stack, cursor: Stack) -> Self {
        Self {
            target,
            cursor,
            changed: true,
        }
    }
}

/// Resolve one click.
///
/// `quantity` is the amount the client asked to move for Primary transfers;
/// `None` means "everything that fits". Secondary clicks ignore it. A declared
/// quantity is applied as declared, with counts clamped at zero, so a client
/// claiming more than the source holds produces a result that creates items.
/// Anything that would push a stack past capacity is refused instead.
pub fn resolve(
    target: Stack,
    cursor: Stack,
    kind: ActionKind,
    quantity: Option<u32>,
    catalog: &dyn ItemCatalog,
) -> Resolution {
    match kind {
        ActionKind::Primary => resolve_primary(target, cursor, quantity, catalog),
        ActionKind::Secondary => resolve_secondary(target, cursor, catalog),
    }
}

fn resolve_primary(
    target: Stack,
    cursor: Stack,
    quantity: Option<u32>,
    catalog: &dyn ItemCatalog,
) -> Resolution {
    match (target.is_empty(), cursor.is_empty()) {
        (true, true) => Resolution::unchanged(target, cursor),

        // Pick up.
        (false, true) => {
            let amount = quantity.unwrap_or(target.count);
            if amount == 0 || amount > catalog.capacity(target.item_id) {
                return Resolution::unchanged(target, cursor);
            }
            Resolution::changed(
                target.with_count(target.count.saturating_sub(amount)),
                Stack::new(target.item_id, amount),
            )
        }

        // Place.
        (true, false) => {
            let amount = quantity.unwrap_or(cursor.count);
            if amount == 0 || amount > catalog.capacity(cursor.item_id) {
                return Resolution::unchanged(target, cursor);
            }
            Resolution::changed(
                Stack::new(cursor.item_id, amount),
                cursor.with_count(cursor.count.saturating_sub(amount)),
            )
        }

        // Merge.
        (false, false) if target.item_id == cursor.item_id => {
            let room = target.room(catalog.capacity(target.item_id));
            let amount = match quantity {
                Some(requested) if requested > room => {
                    return Resolution::unchanged(target, cursor);
                }
                Some(requested) => requested,
                None => room.min(cursor.count),
            };
            if amount == 0 {
                return Resolution::unchanged(target, cursor);
            }
            Resolution::changed(
                target.with_count(target.count + amount),
                cursor.with_count(cursor.count.saturating_sub(amount)),
            )
        }

        // Swap.
        (false, false) => Resolution::changed(cursor, target),
    }
}

fn resolve_secondary(target: Stack, cursor: Stack, catalog: &dyn ItemCatalog) -> Resolution {
    match (target.is_empty(), cursor.is_empty()) {
        // Split: cursor takes the larger half.
        (false, true) => {
            let taken = target.count.div_ceil(2);
            Resolution::changed(
                target.with_count(target.count - taken),
                Stack::new(target.item_id, taken),
            )
        }

        // Drop a single unit into an empty slot.
        (true, false) => Resolution::changed(
            Stack::new(cursor.item_id, 1),
            cursor.with_count(cursor.count - 1),
        ),

        (false, false)
            if target.item_id == cursor.item_id
                && !target.is_full(catalog.capacity(target.item_id)) =>
        {
            Resolution::changed(
                target.with_count(target.count + 1),
                cursor.with_count(cursor.count - 1),
            )
        }

        _ => Resolution::unchanged(target, cursor),
    }
}
