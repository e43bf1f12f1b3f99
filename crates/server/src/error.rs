//! Errors surfaced by the stash engine.

use mdstash_core::{LocationId, SessionId};
use mdstash_world::{ClickError, PersistError, SnapshotKey, ValidationFailure};
use std::sync::Arc;
use thiserror::Error;

/// Engine error.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The tentative result failed the conservation ledger.
    #[error("action rejected: {0}")]
    Validation(#[from] ValidationFailure),
    /// The session exceeded its action ceiling.
    #[error("session {0} exceeded its action budget")]
    RateLimited(SessionId),
    /// The session has no open view of the location.
    #[error("session {session} has no open view of {location}")]
    UnknownLocation {
        /// Acting session.
        session: SessionId,
        /// Location named by the request.
        location: LocationId,
    },
    /// No connected session with this id.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// Session id is already connected.
    #[error("session {0} is already connected")]
    AlreadyConnected(SessionId),
    /// Slot index outside the location.
    #[error("slot {slot} out of range for {location} ({len} slots)")]
    SlotOutOfRange {
        /// Location named by the request.
        location: LocationId,
        /// Requested slot.
        slot: usize,
        /// Slot count of the location.
        len: usize,
    },
    /// The request failed protocol limits.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// Snapshot storage failed after every retry.
    #[error("persistence failed for {key}: {source}")]
    Persistence {
        /// Snapshot key.
        key: SnapshotKey,
        /// Last failure.
        #[source]
        source: Arc<PersistError>,
    },
    /// An actor stopped before answering.
    #[error("{0} actor is gone")]
    ActorGone(String),
}

impl ServerError {
    /// Map a click failure on `location` for `session`.
    pub fn from_click(err: ClickError, session: SessionId, location: LocationId) -> Self {
        match err {
            ClickError::SlotOutOfRange { slot, len } => ServerError::SlotOutOfRange {
                location,
                slot,
                len,
            },
            ClickError::NotViewing(_) => ServerError::UnknownLocation { session, location },
            ClickError::Rejected(failure) => ServerError::Validation(failure),
        }
    }

    /// Errors the client never sees; they only trigger a full resync.
    pub fn forces_resync(&self) -> bool {
        matches!(
            self,
            ServerError::Validation(_)
                | ServerError::RateLimited(_)
                | ServerError::InvalidRequest(_)
                | ServerError::SlotOutOfRange { .. }
        )
    }
}
