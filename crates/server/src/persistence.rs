//! Async retry wrapper around a blocking persistence adapter.

use crate::config::PersistenceConfig;
use crate::error::ServerError;
use mdstash_world::{PersistError, PersistenceAdapter, Snapshot, SnapshotKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Shared handle used by every actor that loads or saves.
#[derive(Clone)]
pub struct Persistence {
    adapter: Arc<dyn PersistenceAdapter>,
    max_attempts: u32,
    backoff: Duration,
    parked: Arc<Mutex<BTreeMap<SnapshotKey, Snapshot>>>,
}

impl Persistence {
    /// Wrap `adapter` with the configured retry policy.
    pub fn new(adapter: Arc<dyn PersistenceAdapter>, config: &PersistenceConfig) -> Self {
        Self {
            adapter,
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
            parked: Arc::default(),
        }
    }

    /// Load with retries. A missing snapshot is `Ok(None)`; a failure is never
    /// replaced by an empty snapshot.
    ///
    /// A parked snapshot is newer than anything stored, so it wins and leaves
    /// the retry queue; its new owner saves it again.
    pub async fn load(&self, key: SnapshotKey) -> Result<Option<Snapshot>, ServerError> {
        if let Some(snapshot) = self.parked.lock().await.remove(&key) {
            debug!(%key, "loaded parked snapshot");
            return Ok(Some(snapshot));
        }
        self.retry(key, "load", self.max_attempts, move |adapter| adapter.load(&key))
            .await
    }

    /// Save with retries.
    pub async fn save(&self, key: SnapshotKey, snapshot: Snapshot) -> Result<(), ServerError> {
        self.retry(key, "save", self.max_attempts, move |adapter| {
            adapter.save(&key, &snapshot)
        })
        .await
    }

    /// Save with retries; once they run out the snapshot is parked for
    /// [`Persistence::retry_parked`] instead of being dropped.
    ///
    /// The error is still returned so the caller can report it.
    pub async fn save_or_park(&self, key: SnapshotKey, snapshot: Snapshot) -> Result<(), ServerError> {
        let result = self.save(key, snapshot.clone()).await;
        if result.is_err() {
            warn!(%key, "snapshot parked for the next maintenance pass");
            self.parked.lock().await.insert(key, snapshot);
        }
        result
    }

    /// Keys waiting in the retry queue.
    pub async fn parked(&self) -> Vec<SnapshotKey> {
        self.parked.lock().await.keys().copied().collect()
    }

    /// One save attempt per parked snapshot. Saved ones leave the queue.
    ///
    /// The queue stays locked throughout so a reload cannot race the write.
    pub async fn retry_parked(&self) {
        let mut parked = self.parked.lock().await;
        let keys: Vec<SnapshotKey> = parked.keys().copied().collect();
        for key in keys {
            let Some(snapshot) = parked.get(&key).cloned() else {
                continue;
            };
            let saved = self
                .retry(key, "save", 1, move |adapter| adapter.save(&key, &snapshot))
                .await;
            if saved.is_ok() {
                parked.remove(&key);
                info!(%key, "parked snapshot saved");
            }
        }
    }

    async fn retry<T, F>(
        &self,
        key: SnapshotKey,
        op: &'static str,
        max_attempts: u32,
        f: F,
    ) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: Fn(&dyn PersistenceAdapter) -> Result<T, PersistError> + Clone + Send + 'static,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let adapter = Arc::clone(&self.adapter);
            let call = f.clone();
            let result = tokio::task::spawn_blocking(move || call(adapter.as_ref()))
                .await
                .map_err(|_| ServerError::ActorGone("persistence worker".to_string()))?;

            match result {
                Ok(value) => {
                    debug!(%key, op, attempt, "persistence call succeeded");
                    return Ok(value);
                }
                Err(source) if attempt >= max_attempts => {
                    error!(%key, op, attempt, %source, "persistence giving up");
                    return Err(ServerError::Persistence {
                        key,
                        source: Arc::new(source),
                    });
                }
                Err(source) => {
                    warn!(%key, op, attempt, %source, "persistence failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}
