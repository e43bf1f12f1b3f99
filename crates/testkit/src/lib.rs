#![warn(missing_docs)]
//! Deterministic testing surfaces for the stash engine.
//!
//! An in-memory persistence adapter with injectable failures, a fixed item
//! catalog and producer, and helpers for draining outbound sync channels.

use mdstash_core::{SessionId, Stack, StaticCatalog};
use mdstash_net::{ServerMessage, SyncMessage};
use mdstash_world::{
    PersistError, PersistenceAdapter, Producer, ProducerAction, ProducerGrant, Snapshot,
    SnapshotKey,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Catalog used across engine tests.
///
/// Items 1..=9 stack to 64, item 10 to 16, item 11 to 1.
pub fn fixture_catalog() -> StaticCatalog {
    let mut entries: Vec<(u16, u32)> = (1..=9).map(|id| (id, 64)).collect();
    entries.push((10, 16));
    entries.push((11, 1));
    StaticCatalog::new(entries)
}

/// Persistence adapter backed by a map, with countdown failure injection.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<SnapshotKey, Snapshot>>,
    failing_loads: AtomicU32,
    failing_saves: AtomicU32,
    loads: AtomicU32,
    saves: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot.
    pub fn insert(&self, key: SnapshotKey, snapshot: Snapshot) {
        self.lock().insert(key, snapshot);
    }

    /// Seed a snapshot from a dense slot list.
    pub fn insert_slots(&self, key: SnapshotKey, slots: &[Stack]) {
        self.insert(key, Snapshot::capture(slots, &[]));
    }

    /// Currently stored snapshot for `key`.
    pub fn get(&self, key: &SnapshotKey) -> Option<Snapshot> {
        self.lock().get(key).cloned()
    }

    /// Make the next `count` loads fail.
    pub fn fail_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` saves fail.
    pub fn fail_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of load calls, failed ones included.
    pub fn load_calls(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of save calls, failed ones included.
    pub fn save_calls(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SnapshotKey, Snapshot>> {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PersistenceAdapter for MemoryStore {
    fn load(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, PersistError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if Self::injected(&self.failing_loads) {
            debug!(%key, "injected load failure");
            return Err(PersistError::Io(io::Error::other("injected load failure")));
        }
        Ok(self.get(key))
    }

    fn save(&self, key: &SnapshotKey, snapshot: &Snapshot) -> Result<(), PersistError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if Self::injected(&self.failing_saves) {
            debug!(%key, "injected save failure");
            return Err(PersistError::Io(io::Error::other("injected save failure")));
        }
        self.insert(*key, snapshot.clone());
        Ok(())
    }
}

/// Producer that grants the same allowance for every action.
#[derive(Debug, Clone, Default)]
pub struct FixedProducer {
    grant: ProducerGrant,
}

impl FixedProducer {
    /// Allow up to `amount` of each listed item per call.
    pub fn new(allowances: impl IntoIterator<Item = (u16, u32)>) -> Self {
        let mut grant = ProducerGrant::none();
        for (item_id, amount) in allowances {
            grant.allow(item_id, amount);
        }
        Self { grant }
    }
}

impl Producer for FixedProducer {
    fn authorize(&self, _session: SessionId, _action: &ProducerAction) -> ProducerGrant {
        self.grant.clone()
    }
}

/// Collect every message currently queued on a session's sync channel.
pub fn drain_messages(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

/// Only the sync messages, in arrival order.
pub fn drain_syncs(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<SyncMessage> {
    drain_messages(rx)
        .into_iter()
        .filter_map(|message| match message {
            ServerMessage::Sync(sync) => Some(sync),
            ServerMessage::CloseAck { .. } => None,
        })
        .collect()
}
