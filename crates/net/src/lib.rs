#![warn(missing_docs)]
//! Wire protocol shared by the stash server and its clients.
//!
//! Messages are plain serde types; [`codec`] frames them with postcard for
//! stream transports and [`reconcile`] folds server updates into a client view.

pub mod codec;
pub mod protocol;
pub mod reconcile;

pub use codec::{
    compute_schema_hash, decode_client_message, decode_server_message, encode_client_message,
    encode_server_message,
};
pub use protocol::{
    ActionRequest, ClientMessage, ServerMessage, SlotChange, SyncMessage, MAX_QUANTITY, MAX_SLOTS,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use reconcile::{apply, LocalView, LocationView};

use serde::{Deserialize, Serialize};

/// Schema hash for on-the-wire compatibility checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaHash(pub u64);

impl SchemaHash {
    /// Hash of the protocol compiled into this build.
    pub fn current() -> Self {
        Self(compute_schema_hash())
    }
}
