#![warn(missing_docs)]
//! Authoritative slot state: inventories, shared containers, the
//! conservation ledger and snapshot persistence.

pub mod container;
pub mod inventory;
pub mod ledger;
pub mod persist;
pub mod producer;
pub mod slots;
pub mod transact;

pub use container::{Container, CONTAINER_SLOT_COUNT};
pub use inventory::{Inventory, INVENTORY_SIZE, PRIMARY_SIZE, QUICKBAR_SIZE};
pub use ledger::{validate, Place, Touched, Transaction, ValidationFailure};
pub use persist::{
    EmptySaveGuard, PersistError, PersistenceAdapter, Restored, Snapshot, SnapshotKey, SnapshotSlot,
    SnapshotStore, SnapshotV1, VersionedSnapshot, SNAPSHOT_SCHEMA_VERSION,
};
pub use producer::{DenyAll, Producer, ProducerAction, ProducerGrant};
pub use slots::{SlotArray, SlotWrite};
pub use transact::{click, settle_overflow, ClickError, Commit};
