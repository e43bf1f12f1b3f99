//! Resolve → validate → commit for one click on a slot array.

use crate::ledger::{validate, Place, Transaction, ValidationFailure};
use crate::producer::ProducerGrant;
use crate::slots::SlotArray;
use mdstash_core::{resolve, ActionKind, ItemCatalog, SessionId, Stack};
use thiserror::Error;

/// Why a click was not committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClickError {
    /// Slot index outside the array.
    #[error("slot {slot} out of range (len {len})")]
    SlotOutOfRange {
        /// Requested slot.
        slot: usize,
        /// Array length.
        len: usize,
    },
    /// Session is not viewing the container it clicked.
    #[error("session {0} is not viewing this container")]
    NotViewing(SessionId),
    /// The tentative result broke conservation or bounds.
    #[error("rejected: {0}")]
    Rejected(#[from] ValidationFailure),
}

/// Committed result of one click.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    /// Changed `(slot, stack)` pairs, in slot order.
    pub changes: Vec<(usize, Stack)>,
    /// Cursor after the click.
    pub cursor: Stack,
}

impl Commit {
    /// Returns true when nothing changed.
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Apply one click to `slots` with `cursor` as the held stack.
///
/// State is only written after the transaction validated, so on error both
/// `slots` and `cursor` are exactly as they were.
pub fn click(
    slots: &mut SlotArray,
    cursor: &mut Stack,
    slot: usize,
    kind: ActionKind,
    quantity: Option<u32>,
    catalog: &dyn ItemCatalog,
) -> Result<Commit, ClickError> {
    let target = slots.get(slot).ok_or(ClickError::SlotOutOfRange {
        slot,
        len: slots.len(),
    })?;

    let resolution = resolve(target, *cursor, kind, quantity, catalog);
    if !resolution.changed {
        return Ok(Commit {
            changes: Vec::new(),
            cursor: *cursor,
        });
    }

    let mut tx = Transaction::new();
    tx.touch(Place::Slot(slot), target, resolution.target)
        .touch(Place::Cursor, *cursor, resolution.cursor);
    validate(&tx, &ProducerGrant::none(), catalog)?;

    slots.set(slot, resolution.target);
    *cursor = resolution.cursor;
    let changes = if resolution.target != target {
        vec![(slot, resolution.target)]
    } else {
        Vec::new()
    };
    Ok(Commit {
        changes,
        cursor: *cursor,
    })
}

/// Move as much of `overflow` as fits into `slots`. Returns changed slots.
pub fn settle_overflow(
    slots: &mut SlotArray,
    overflow: &mut Vec<Stack>,
    catalog: &dyn ItemCatalog,
) -> Vec<(usize, Stack)> {
    let mut touched = Vec::new();
    let pending = std::mem::take(overflow);
    for stack in pending {
        let (writes, leftover) = slots.plan_deposit(stack, catalog);
        touched.extend(slots.apply(&writes).into_iter().map(|(index, _)| index));
        if !leftover.is_empty() {
            overflow.push(leftover);
        }
    }
    touched.sort_unstable();
    touched.dedup();
    touched
        .into_iter()
        .filter_map(|index| slots.get(index).map(|stack| (index, stack)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdstash_core::StaticCatalog;

    #[test]
    fn rejected_click_leaves_state_untouched() {
        let catalog = StaticCatalog::uniform(4);
        let mut slots = SlotArray::new(3);
        let mut cursor = Stack::new(2, 1);

        let err = click(
            &mut slots,
            &mut cursor,
            1,
            ActionKind::Primary,
            Some(64),
            &catalog,
        )
        .unwrap_err();

        assert!(matches!(err, ClickError::Rejected(_)));
        assert_eq!(slots.get(1), Some(Stack::EMPTY));
        assert_eq!(cursor, Stack::new(2, 1));
    }

    #[test]
    fn out_of_range_slot_is_reported() {
        let catalog = StaticCatalog::uniform(4);
        let mut slots = SlotArray::new(3);
        let mut cursor = Stack::EMPTY;
        assert_eq!(
            click(&mut slots, &mut cursor, 3, ActionKind::Primary, None, &catalog),
            Err(ClickError::SlotOutOfRange { slot: 3, len: 3 })
        );
    }

    #[test]
    fn overflow_settles_into_free_slots() {
        let catalog = StaticCatalog::uniform(4);
        let mut slots = SlotArray::from_stacks(vec![Stack::new(1, 60), Stack::EMPTY]);
        let mut overflow = vec![Stack::new(1, 10), Stack::new(3, 5)];

        let changes = settle_overflow(&mut slots, &mut overflow, &catalog);

        assert_eq!(slots.get(0), Some(Stack::new(1, 64)));
        assert_eq!(slots.get(1), Some(Stack::new(1, 6)));
        assert_eq!(overflow, vec![Stack::new(3, 5)]);
        assert_eq!(changes.len(), 2);
    }
}
