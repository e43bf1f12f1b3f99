//! Messages exchanged between stash clients and the authoritative server.
//!
//! Types are plain serde: postcard on the wire, JSON in scripts and logs.

use mdstash_core::{ActionKind, ContainerKey, LocationId, Stack};
use serde::{Deserialize, Serialize};

/// Bumped whenever a message layout changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Handshake magic.
pub const PROTOCOL_MAGIC: &[u8; 10] = b"MDST\x00\x01\x00\x00\x00\x00";

/// Highest slot count any location exposes. Indices at or above are invalid.
pub const MAX_SLOTS: usize = 64;

/// Largest quantity a client may declare for one action.
pub const MAX_QUANTITY: u32 = 4096;

/// One click requested by a client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRequest {
    /// Slot set being clicked.
    pub location: LocationId,
    /// Slot index inside the location.
    pub slot: u16,
    /// Click kind.
    pub kind: ActionKind,
    /// Amount the client asks to move (Primary only).
    #[serde(default)]
    pub quantity: Option<u32>,
}

impl ActionRequest {
    /// Primary click without a declared quantity.
    pub fn primary(location: LocationId, slot: u16) -> Self {
        Self {
            location,
            slot,
            kind: ActionKind::Primary,
            quantity: None,
        }
    }

    /// Secondary click.
    pub fn secondary(location: LocationId, slot: u16) -> Self {
        Self {
            location,
            slot,
            kind: ActionKind::Secondary,
            quantity: None,
        }
    }

    /// Verify request limits.
    pub fn verify(&self) -> Result<(), &'static str> {
        if usize::from(self.slot) >= MAX_SLOTS {
            return Err("Slot index out of range");
        }
        if self.quantity.is_some_and(|q| q > MAX_QUANTITY) {
            return Err("Quantity too large");
        }
        Ok(())
    }
}

/// Client requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientMessage {
    /// Start viewing a container.
    Open {
        /// Container to open.
        key: ContainerKey,
    },
    /// Stop viewing a container.
    Close {
        /// Container to close.
        key: ContainerKey,
    },
    /// Click a slot.
    Action(ActionRequest),
    /// Session is leaving; every open container closes first.
    Disconnect,
}

impl ClientMessage {
    /// Check size limits before anything else looks at the message.
    ///
    /// This should be called on all received messages before dispatch.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            ClientMessage::Action(request) => request.verify(),
            _ => Ok(()),
        }
    }
}

/// New value for one slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotChange {
    /// Slot index.
    pub slot: u16,
    /// Authoritative stack.
    pub stack: Stack,
}

/// Authoritative state pushed to a client for one location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMessage {
    /// Every slot of the location plus the receiving session's cursor.
    Full {
        /// Location described.
        location: LocationId,
        /// All slots in order.
        slots: Vec<Stack>,
        /// Receiving session's cursor for this location.
        cursor: Stack,
    },
    /// Only the slots that changed since the last flush.
    Delta {
        /// Location described.
        location: LocationId,
        /// Changed slots in slot order.
        changes: Vec<SlotChange>,
        /// Receiving session's cursor, when it changed.
        cursor: Option<Stack>,
    },
}

impl SyncMessage {
    /// Location this message describes.
    pub fn location(&self) -> LocationId {
        match self {
            SyncMessage::Full { location, .. } | SyncMessage::Delta { location, .. } => *location,
        }
    }

    /// Returns true for a full snapshot.
    pub fn is_full(&self) -> bool {
        matches!(self, SyncMessage::Full { .. })
    }

    /// Verify message limits.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            SyncMessage::Full { slots, .. } if slots.len() > MAX_SLOTS => {
                Err("Too many slots in full sync")
            }
            SyncMessage::Delta { changes, .. } if changes.len() > MAX_SLOTS => {
                Err("Too many changes in delta sync")
            }
            SyncMessage::Delta { changes, .. }
                if changes.iter().any(|c| usize::from(c.slot) >= MAX_SLOTS) =>
            {
                Err("Slot index out of range")
            }
            _ => Ok(()),
        }
    }
}

/// Server pushes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    /// Slot state update.
    Sync(SyncMessage),
    /// Acknowledges a Close.
    CloseAck {
        /// Container that was closed.
        key: ContainerKey,
    },
}

impl ServerMessage {
    /// Check size limits before anything else looks at the message.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            ServerMessage::Sync(sync) => sync.verify(),
            ServerMessage::CloseAck { .. } => Ok(()),
        }
    }
}
