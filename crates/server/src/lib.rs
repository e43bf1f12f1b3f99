#![warn(missing_docs)]
//! Authoritative stash host.
//!
//! One actor per session inventory and per container key, a sync scheduler
//! that batches outbound state, and a registry that loads and evicts
//! containers. [`StashServer`] wires them together.

pub mod audit;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod persistence;
pub mod rate_limit;
pub mod registry;
pub mod sync;

pub use audit::{AuditLog, AuditRecord};
pub use config::{PersistenceConfig, RateLimitConfig, ServerConfig};
pub use container::ContainerHandle;
pub use engine::{Session, StashServer};
pub use error::ServerError;
pub use inventory::{ActorContext, InventoryHandle};
pub use persistence::Persistence;
pub use rate_limit::RateLimiter;
pub use registry::RegistryHandle;
pub use sync::{MirrorKey, SyncCommit, SyncHandle, SyncReceiver, SyncScheduler, SyncSink};
