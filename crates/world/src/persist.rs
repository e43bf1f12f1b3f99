//! Versioned slot snapshots and the file-backed snapshot store.
//!
//! Each key is stored in its own `.mds` file: a 14-byte header (magic,
//! schema version, CRC32, payload length) followed by a zstd-compressed
//! bincode payload. Writes land in a temporary file that is renamed over the
//! old one, so a failed save never leaves a truncated or empty snapshot in
//! place of a good one.

use mdstash_core::{ContainerKey, ItemCatalog, ItemId, SessionId, Stack};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Magic number for snapshot file identification ("MDST").
const SNAPSHOT_MAGIC: u32 = 0x4D44_5354;

/// Size of the on-disk header in bytes.
const HEADER_LEN: usize = 14;

/// Current snapshot schema.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 2;

/// Identifies what a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SnapshotKey {
    /// A player's private inventory.
    Inventory(SessionId),
    /// A shared world container.
    Container(ContainerKey),
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKey::Inventory(session) => write!(f, "inv.{}", session.0),
            SnapshotKey::Container(key) => write!(f, "c.{key}"),
        }
    }
}

/// Errors raised by persistence backends.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Underlying IO failure.
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    /// File exists but cannot be trusted.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    /// Schema newer than this build understands.
    #[error("unsupported snapshot schema version {0}")]
    UnsupportedVersion(u32),
    /// Serialization failed.
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// One non-empty slot in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSlot {
    /// Slot index within the array.
    pub index: u16,
    /// Item id.
    pub item_id: ItemId,
    /// Item count.
    pub count: u32,
}

/// Persisted slot state for one inventory or container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Schema the snapshot was written with.
    pub schema_version: u32,
    /// Non-empty slots; empty slots are omitted.
    pub slots: Vec<SnapshotSlot>,
    /// Stacks that fit nowhere when the snapshot was taken.
    #[serde(default)]
    pub overflow: Vec<Stack>,
}

/// Schema 1: one dense `(item_id, count)` entry per slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotV1 {
    /// Positional slot contents.
    pub slots: Vec<(ItemId, u32)>,
}

/// Any snapshot schema this build can read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedSnapshot {
    /// Legacy dense layout.
    V1(SnapshotV1),
    /// Current sparse layout.
    V2(Snapshot),
}

impl VersionedSnapshot {
    /// Map any older schema into the current shape.
    pub fn migrate(self) -> Snapshot {
        match self {
            VersionedSnapshot::V1(legacy) => Snapshot {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                slots: legacy
                    .slots
                    .into_iter()
                    .enumerate()
                    .filter(|(_, (item_id, count))| *item_id != 0 && *count != 0)
                    .filter_map(|(index, (item_id, count))| {
                        u16::try_from(index).ok().map(|index| SnapshotSlot {
                            index,
                            item_id,
                            count,
                        })
                    })
                    .collect(),
                overflow: Vec::new(),
            },
            VersionedSnapshot::V2(mut current) => {
                current.schema_version = SNAPSHOT_SCHEMA_VERSION;
                current
            }
        }
    }
}

/// Slot state rebuilt from a snapshot after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restored {
    /// Dense slots, `len` entries.
    pub slots: Vec<Stack>,
    /// Stacks with nowhere to go (over-capacity excess, duplicate indices).
    pub overflow: Vec<Stack>,
    /// Entries dropped because their item id is unknown or their index is out of range.
    pub dropped: usize,
}

impl Snapshot {
    /// Capture `slots` (and any overflow) in the current schema.
    pub fn capture(slots: &[Stack], overflow: &[Stack]) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            slots: slots
                .iter()
                .enumerate()
                .filter(|(_, stack)| !stack.is_empty())
                .filter_map(|(index, stack)| {
                    u16::try_from(index).ok().map(|index| SnapshotSlot {
                        index,
                        item_id: stack.item_id,
                        count: stack.count,
                    })
                })
                .collect(),
            overflow: overflow.iter().copied().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Returns true when the snapshot holds no items at all.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.count == 0 || slot.item_id == 0)
            && self.overflow.iter().all(Stack::is_empty)
    }

    /// Rebuild `len` dense slots, dropping unknown items and splitting
    /// over-capacity counts into overflow.
    pub fn restore(&self, len: usize, catalog: &dyn ItemCatalog) -> Restored {
        let mut slots = vec![Stack::EMPTY; len];
        let mut overflow = Vec::new();
        let mut dropped = 0;

        let entries = self
            .slots
            .iter()
            .map(|slot| (Some(usize::from(slot.index)), Stack::new(slot.item_id, slot.count)))
            .chain(self.overflow.iter().map(|stack| (None, *stack)));

        for (index, stack) in entries {
            if stack.is_empty() {
                continue;
            }
            let info = catalog.lookup(stack.item_id);
            if !info.valid {
                warn!(item_id = stack.item_id, count = stack.count, "dropping unknown item from snapshot");
                dropped += 1;
                continue;
            }
            let kept = stack.count.min(info.capacity);
            let excess = stack.count - kept;
            match index {
                Some(index) if index >= len => {
                    warn!(index, len, "dropping out-of-range snapshot slot");
                    dropped += 1;
                    continue;
                }
                Some(index) if slots[index].is_empty() => {
                    slots[index] = stack.with_count(kept);
                    if excess > 0 {
                        warn!(index, excess, "snapshot slot over capacity, moving excess to overflow");
                        overflow.push(stack.with_count(excess));
                    }
                }
                _ => overflow.push(stack),
            }
        }

        Restored {
            slots,
            overflow,
            dropped,
        }
    }
}

/// Refuses to replace stored items with an empty snapshot unless the
/// emptiness came from committed changes.
///
/// A load that restored nothing (every entry dropped as unknown, say) must
/// not erase the file on the next save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptySaveGuard {
    loaded_items: bool,
    changed: bool,
}

impl EmptySaveGuard {
    /// Guard for state that was just loaded from `snapshot`.
    pub fn after_load(snapshot: Option<&Snapshot>) -> Self {
        Self {
            loaded_items: snapshot.is_some_and(|snapshot| !snapshot.is_empty()),
            changed: false,
        }
    }

    /// Note a committed mutation.
    pub fn record_change(&mut self) {
        self.changed = true;
    }

    /// Returns true when writing `snapshot` cannot lose stored items by accident.
    pub fn allows(&self, snapshot: &Snapshot) -> bool {
        !snapshot.is_empty() || !self.loaded_items || self.changed
    }
}

/// Load/save boundary for snapshots.
///
/// `load` returns `Ok(None)` only when the key has never been saved. Any
/// other failure must be an error so callers never mistake it for "empty".
pub trait PersistenceAdapter: Send + Sync {
    /// Load the snapshot for `key`.
    fn load(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, PersistError>;

    /// Save the snapshot for `key`.
    fn save(&self, key: &SnapshotKey, snapshot: &Snapshot) -> Result<(), PersistError>;
}

/// Snapshot file header structure.
#[derive(Debug, Clone)]
struct SnapshotHeader {
    magic: u32,
    version: u16,
    crc32: u32,
    payload_len: u32,
}

impl SnapshotHeader {
    fn new(version: u16, crc32: u32, payload_len: u32) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version,
            crc32,
            payload_len,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        if bytes.len() < HEADER_LEN {
            return Err(PersistError::Corrupt("snapshot header too short".into()));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != SNAPSHOT_MAGIC {
            return Err(PersistError::Corrupt(format!(
                "invalid snapshot magic: expected 0x{:08X}, got 0x{:08X}",
                SNAPSHOT_MAGIC, magic
            )));
        }

        Ok(Self {
            magic,
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            crc32: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            payload_len: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
        })
    }
}

/// File-backed snapshot store rooted at a data directory.
pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `data_dir`, creating the directory.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, PersistError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    /// Path of the snapshot file for `key`.
    pub fn snapshot_path(&self, key: &SnapshotKey) -> PathBuf {
        self.data_dir.join(format!("{key}.mds"))
    }

    /// Write a snapshot in an explicit schema (used to produce legacy files).
    pub fn write_versioned(
        &self,
        key: &SnapshotKey,
        snapshot: &VersionedSnapshot,
    ) -> Result<(), PersistError> {
        let (version, payload) = match snapshot {
            VersionedSnapshot::V1(legacy) => (1u16, bincode::serialize(legacy)),
            VersionedSnapshot::V2(current) => {
                (SNAPSHOT_SCHEMA_VERSION as u16, bincode::serialize(current))
            }
        };
        let payload = payload.map_err(|e| PersistError::Encode(e.to_string()))?;

        // Level 3 keeps small snapshots fast to write.
        let compressed = zstd::encode_all(&payload[..], 3)?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let header = SnapshotHeader::new(version, hasher.finalize(), compressed.len() as u32);

        let path = self.snapshot_path(key);
        let tmp_path = path.with_extension("mds.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&header.to_bytes())?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn read_versioned(&self, key: &SnapshotKey) -> Result<Option<VersionedSnapshot>, PersistError> {
        let path = self.snapshot_path(key);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut header_bytes = [0u8; HEADER_LEN];
        file.read_exact(&mut header_bytes)?;
        let header = SnapshotHeader::from_bytes(&header_bytes)?;

        let available = file.metadata()?.len().saturating_sub(HEADER_LEN as u64);
        if u64::from(header.payload_len) > available {
            return Err(PersistError::Corrupt(format!(
                "payload length {} exceeds the {available} bytes on disk",
                header.payload_len
            )));
        }
        let mut compressed = vec![0u8; header.payload_len as usize];
        file.read_exact(&mut compressed)?;

        let mut hasher = Hasher::new();
        hasher.update(&compressed);
        let computed_crc = hasher.finalize();
        if computed_crc != header.crc32 {
            return Err(PersistError::Corrupt(format!(
                "CRC32 mismatch: expected {:08X}, got {:08X}",
                header.crc32, computed_crc
            )));
        }

        let payload = zstd::decode_all(&compressed[..])?;
        let decoded = match u32::from(header.version) {
            1 => bincode::deserialize(&payload).map(VersionedSnapshot::V1),
            SNAPSHOT_SCHEMA_VERSION => bincode::deserialize(&payload).map(VersionedSnapshot::V2),
            other => return Err(PersistError::UnsupportedVersion(other)),
        };
        decoded
            .map(Some)
            .map_err(|e| PersistError::Corrupt(format!("failed to decode payload: {e}")))
    }
}

impl PersistenceAdapter for SnapshotStore {
    fn load(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, PersistError> {
        Ok(self.read_versioned(key)?.map(VersionedSnapshot::migrate))
    }

    fn save(&self, key: &SnapshotKey, snapshot: &Snapshot) -> Result<(), PersistError> {
        self.write_versioned(key, &VersionedSnapshot::V2(snapshot.clone()))
    }
}
