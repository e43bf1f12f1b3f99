//! Shared world container with multiple concurrent viewers.
//!
//! Viewers and cursors are stored as plain session ids, so a container and
//! the sessions viewing it can be torn down independently.

use crate::ledger::{validate, Place, Transaction};
use crate::persist::Snapshot;
use crate::producer::ProducerGrant;
use crate::slots::SlotArray;
use crate::transact::{click, settle_overflow, ClickError, Commit};
use mdstash_core::{ActionKind, ContainerKey, ItemCatalog, SessionId, Stack};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Number of slots in a single container (3 rows × 9 columns).
pub const CONTAINER_SLOT_COUNT: usize = 27;

/// Authoritative state of one container.
#[derive(Debug, Clone)]
pub struct Container {
    key: ContainerKey,
    slots: SlotArray,
    viewers: BTreeSet<SessionId>,
    cursors: BTreeMap<SessionId, Stack>,
    overflow: Vec<Stack>,
    unsaved: bool,
}

impl Container {
    /// Create an empty container.
    pub fn new(key: ContainerKey) -> Self {
        Self {
            key,
            slots: SlotArray::new(CONTAINER_SLOT_COUNT),
            viewers: BTreeSet::new(),
            cursors: BTreeMap::new(),
            overflow: Vec::new(),
            unsaved: false,
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_snapshot(key: ContainerKey, snapshot: &Snapshot, catalog: &dyn ItemCatalog) -> Self {
        let restored = snapshot.restore(CONTAINER_SLOT_COUNT, catalog);
        if restored.dropped > 0 {
            warn!(%key, dropped = restored.dropped, "container snapshot had invalid entries");
        }
        let mut container = Self::new(key);
        container.slots = SlotArray::from_stacks(restored.slots);
        container.overflow = restored.overflow;
        settle_overflow(&mut container.slots, &mut container.overflow, catalog);
        container
    }

    /// World key of this container.
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    /// Slots in order.
    pub fn slots(&self) -> &[Stack] {
        self.slots.as_slice()
    }

    /// Stacks waiting for free space.
    pub fn overflow(&self) -> &[Stack] {
        &self.overflow
    }

    /// Sessions currently viewing.
    pub fn viewers(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.viewers.iter().copied()
    }

    /// Number of viewers.
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Returns true when `session` has this container open.
    pub fn is_viewer(&self, session: SessionId) -> bool {
        self.viewers.contains(&session)
    }

    /// Cursor held by `session` while visiting.
    pub fn cursor(&self, session: SessionId) -> Option<Stack> {
        self.cursors.get(&session).copied()
    }

    /// All active cursors.
    pub fn cursors(&self) -> impl Iterator<Item = (SessionId, Stack)> + '_ {
        self.cursors.iter().map(|(session, stack)| (*session, *stack))
    }

    /// With no viewers the container may be saved and dropped from memory.
    pub fn is_evictable(&self) -> bool {
        self.viewers.is_empty()
    }

    /// Returns true when state changed since the last successful save.
    pub fn needs_save(&self) -> bool {
        self.unsaved
    }

    /// Record that the current state has been persisted.
    pub fn mark_saved(&mut self) {
        self.unsaved = false;
    }

    /// Add a viewer with an empty cursor. Re-opening keeps the existing cursor.
    pub fn open(&mut self, session: SessionId) -> bool {
        self.cursors.entry(session).or_insert(Stack::EMPTY);
        self.viewers.insert(session)
    }

    /// Click a slot as `session`.
    pub fn click(
        &mut self,
        session: SessionId,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
        catalog: &dyn ItemCatalog,
    ) -> Result<Commit, ClickError> {
        if !self.viewers.contains(&session) {
            return Err(ClickError::NotViewing(session));
        }
        let cursor = self.cursors.entry(session).or_insert(Stack::EMPTY);
        let mut commit = click(&mut self.slots, cursor, slot, kind, quantity, catalog)?;
        if !commit.is_noop() {
            self.unsaved = true;
            self.settle(&mut commit.changes, catalog);
        }
        Ok(commit)
    }

    /// Take the viewer's cursor for draining elsewhere.
    pub fn take_cursor(&mut self, session: SessionId) -> Stack {
        self.cursors
            .get_mut(&session)
            .map(Stack::take)
            .unwrap_or(Stack::EMPTY)
    }

    /// Put a stack back into the container: merge, then first empty slot,
    /// then overflow. Never discards. Returns changed slots.
    pub fn force_deposit(&mut self, stack: Stack, catalog: &dyn ItemCatalog) -> Vec<(usize, Stack)> {
        if stack.is_empty() {
            return Vec::new();
        }
        let (writes, leftover) = self.slots.plan_deposit(stack, catalog);
        let mut tx = Transaction::new();
        tx.touch_slots(&writes).touch(Place::Transfer, stack, leftover);
        if let Err(failure) = validate(&tx, &ProducerGrant::none(), catalog) {
            warn!(key = %self.key, %failure, "force deposit rejected, keeping stack in overflow");
            self.overflow.push(stack);
            self.unsaved = true;
            return Vec::new();
        }
        let changes = self.slots.apply(&writes);
        if !leftover.is_empty() {
            warn!(key = %self.key, item_id = leftover.item_id, count = leftover.count, "container full, stack kept in overflow");
            self.overflow.push(leftover);
        }
        self.unsaved = true;
        changes
    }

    /// Remove a viewer. Any stack still on its cursor is force-deposited.
    /// Returns the changed slots and whether the container is now unviewed.
    pub fn close(&mut self, session: SessionId, catalog: &dyn ItemCatalog) -> (Vec<(usize, Stack)>, bool) {
        let held = self.take_cursor(session);
        let changes = self.force_deposit(held, catalog);
        self.cursors.remove(&session);
        self.viewers.remove(&session);
        (changes, self.viewers.is_empty())
    }

    /// Persistable view. Cursors are never persisted.
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

#[cfg(test)]
mod tests {
    use super::*;
    use mdstash_core::StaticCatalog;

    const KEY: ContainerKey = ContainerKey::new(0, 64, 0);
    const S1: SessionId = SessionId(1);
    const S2: SessionId = SessionId(2);

    fn stocked() -> (Container, StaticCatalog) {
        let catalog = StaticCatalog::uniform(16);
        let mut snapshot_slots = vec![Stack::EMPTY; CONTAINER_SLOT_COUNT];
        snapshot_slots[0] = Stack::new(3, 40);
        let container =
            Container::from_snapshot(KEY, &Snapshot::capture(&snapshot_slots, &[]), &catalog);
        (container, catalog)
    }

    #[test]
    fn clicks_require_an_open_view() {
        let (mut container, catalog) = stocked();
        assert_eq!(
            container.click(S1, 0, ActionKind::Primary, None, &catalog),
            Err(ClickError::NotViewing(S1))
        );
        assert_eq!(container.slots()[0], Stack::new(3, 40));
    }

    #[test]
    fn viewers_have_independent_cursors() {
        let (mut container, catalog) = stocked();
        container.open(S1);
        container.open(S2);

        container.click(S1, 0, ActionKind::Secondary, None, &catalog).unwrap();
        container.click(S2, 0, ActionKind::Primary, None, &catalog).unwrap();

        assert_eq!(container.cursor(S1), Some(Stack::new(3, 20)));
        assert_eq!(container.cursor(S2), Some(Stack::new(3, 20)));
        assert_eq!(container.slots()[0], Stack::EMPTY);
        assert!(container.needs_save());
    }

    #[test]
    fn close_returns_cursor_to_container() {
        let (mut container, catalog) = stocked();
        container.open(S1);
        container.click(S1, 0, ActionKind::Primary, None, &catalog).unwrap();

        let (changes, unviewed) = container.close(S1, &catalog);
        assert!(unviewed);
        assert!(container.is_evictable());
        assert_eq!(changes, vec![(0, Stack::new(3, 40))]);
        assert!(container.cursor(S1).is_none());
    }

    #[test]
    fn full_container_keeps_deposit_in_overflow() {
        let catalog = StaticCatalog::uniform(64);
        let mut container = Container::new(KEY);
        for (index, id) in (1..=CONTAINER_SLOT_COUNT as u16).enumerate() {
            container.force_deposit(Stack::new(id, 1), &catalog);
            assert_eq!(container.slots()[index], Stack::new(id, 1));
        }

        let changes = container.force_deposit(Stack::new(60, 3), &catalog);
        assert!(changes.is_empty());
        assert_eq!(container.overflow(), &[Stack::new(60, 3)]);
        assert_eq!(container.snapshot().overflow, vec![Stack::new(60, 3)]);
    }
}
