//! Audit trail for rejected actions.
//!
//! Every rejection is logged under the `mdstash::audit` target; when a file
//! is configured it also receives one JSON line per rejection.

use chrono::{DateTime, Utc};
use mdstash_core::{LocationId, SessionId};
use mdstash_world::ValidationFailure;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// One audit line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// When the rejection happened.
    pub timestamp: DateTime<Utc>,
    /// Acting session.
    pub session: u64,
    /// Location named by the action.
    pub location: String,
    /// Why the action was refused.
    pub reason: &'static str,
    /// Offending item, when the ledger named one.
    pub item_id: Option<u16>,
    /// Net change the action attempted.
    pub delta: Option<i64>,
    /// Full ledger message.
    pub detail: String,
}

/// Sink for rejected actions.
pub struct AuditLog {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl AuditLog {
    /// Log to tracing only.
    pub fn disabled() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    /// Append JSON lines to `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// Record a ledger rejection.
    pub fn rejected(&self, session: SessionId, location: LocationId, failure: &ValidationFailure) {
        warn!(
            target: "mdstash::audit",
            %session,
            %location,
            item_id = failure.item_id(),
            delta = failure.delta(),
            "rejected action: {failure}"
        );
        self.append(AuditRecord {
            timestamp: Utc::now(),
            session: session.0,
            location: location.to_string(),
            reason: "validation",
            item_id: Some(failure.item_id()),
            delta: Some(failure.delta()),
            detail: failure.to_string(),
        });
    }

    /// Record an action dropped by the rate limiter.
    pub fn rate_limited(&self, session: SessionId, location: LocationId) {
        warn!(target: "mdstash::audit", %session, %location, "action over rate limit");
        self.append(AuditRecord {
            timestamp: Utc::now(),
            session: session.0,
            location: location.to_string(),
            reason: "rate_limited",
            item_id: None,
            delta: None,
            detail: String::new(),
        });
    }

    /// Push buffered lines to disk.
    pub fn flush(&self) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = guard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!("Failed to flush audit log: {err}");
            }
        }
    }

    fn append(&self, record: AuditRecord) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let result = serde_json::to_writer(&mut *writer, &record)
            .map_err(io::Error::from)
            .and_then(|()| writeln!(writer));
        if let Err(err) = result {
            warn!("Failed to write audit record: {err}");
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.flush();
    }
}
