//! Client-side prediction and server reconciliation for slot views.
//!
//! The client resolves clicks locally for responsiveness. Server sync
//! messages always win: a full snapshot replaces the location wholesale and
//! a delta overwrites exactly the listed slots.

use crate::protocol::{SlotChange, SyncMessage};
use mdstash_core::{resolve, ActionKind, ItemCatalog, LocationId, Stack};
use std::collections::BTreeMap;
use tracing::debug;

/// One location as the client believes it to be.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationView {
    /// Slots in order.
    pub slots: Vec<Stack>,
    /// Cursor held while interacting with this location.
    pub cursor: Stack,
    /// Number of local clicks not yet confirmed by the server.
    pub pending: u32,
}

/// Everything a client currently displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalView {
    locations: BTreeMap<LocationId, LocationView>,
}

impl LocalView {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// View of one location, if known.
    pub fn location(&self, location: LocationId) -> Option<&LocationView> {
        self.locations.get(&location)
    }

    /// Stack in a slot, if the location is known.
    pub fn slot(&self, location: LocationId, slot: usize) -> Option<Stack> {
        self.locations.get(&location)?.slots.get(slot).copied()
    }

    /// Forget a location (after a close acknowledgement).
    pub fn forget(&mut self, location: LocationId) {
        self.locations.remove(&location);
    }

    /// Resolve a click locally before the server answers.
    ///
    /// Returns false when the location or slot is unknown and nothing was predicted.
    pub fn predict(
        &mut self,
        location: LocationId,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
        catalog: &dyn ItemCatalog,
    ) -> bool {
        let Some(view) = self.locations.get_mut(&location) else {
            return false;
        };
        let Some(target) = view.slots.get_mut(slot) else {
            return false;
        };
        let resolution = resolve(*target, view.cursor, kind, quantity, catalog);
        if resolution.changed {
            *target = resolution.target;
            view.cursor = resolution.cursor;
            view.pending += 1;
        }
        resolution.changed
    }

    /// Fold an authoritative message into the view.
    pub fn apply(&mut self, message: &SyncMessage) {
        match message {
            SyncMessage::Full {
                location,
                slots,
                cursor,
            } => {
                self.locations.insert(
                    *location,
                    LocationView {
                        slots: slots.clone(),
                        cursor: *cursor,
                        pending: 0,
                    },
                );
            }
            SyncMessage::Delta {
                location,
                changes,
                cursor,
            } => {
                let Some(view) = self.locations.get_mut(location) else {
                    debug!(%location, "delta for unknown location ignored");
                    return;
                };
                for SlotChange { slot, stack } in changes {
                    match view.slots.get_mut(usize::from(*slot)) {
                        Some(target) => *target = *stack,
                        None => debug!(%location, slot, "delta slot outside known view"),
                    }
                }
                if let Some(cursor) = cursor {
                    view.cursor = *cursor;
                }
                view.pending = view.pending.saturating_sub(1);
            }
        }
    }
}

/// Reducer form of [`LocalView::apply`].
pub fn apply(mut view: LocalView, message: &SyncMessage) -> LocalView {
    view.apply(message);
    view
}
