//! Engine wiring: server construction, sessions and the producer surface.

use crate::audit::AuditLog;
use crate::config::ServerConfig;
use crate::container::ContainerHandle;
use crate::error::ServerError;
use crate::inventory::{ActorContext, InventoryHandle};
use crate::persistence::Persistence;
use crate::rate_limit::RateLimiter;
use crate::registry::RegistryHandle;
use crate::sync::{SyncHandle, SyncReceiver, SyncSink};
use mdstash_core::{ContainerKey, ItemCatalog, ItemId, LocationId, SessionId};
use mdstash_net::{ActionRequest, ClientMessage};
use mdstash_world::{Container, Inventory, PersistenceAdapter, Producer, ProducerAction};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

struct Shared {
    config: ServerConfig,
    ctx: ActorContext,
    producer: Arc<dyn Producer>,
    registry: RegistryHandle,
    inventories: Mutex<HashMap<SessionId, InventoryHandle>>,
}

impl Shared {
    fn inventory(&self, session: SessionId) -> Result<InventoryHandle, ServerError> {
        self.inventories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .cloned()
            .ok_or(ServerError::UnknownSession(session))
    }
}

/// Authoritative stash engine.
///
/// Must be created inside a tokio runtime; every component runs as a task.
#[derive(Clone)]
pub struct StashServer {
    shared: Arc<Shared>,
}

impl StashServer {
    /// Start the scheduler and registry actors.
    pub fn start(
        config: ServerConfig,
        catalog: Arc<dyn ItemCatalog>,
        producer: Arc<dyn Producer>,
        adapter: Arc<dyn PersistenceAdapter>,
        audit: AuditLog,
    ) -> Self {
        let sync = SyncHandle::spawn(
            config.full_resync_threshold,
            config.flush_interval(),
            config.mailbox(),
        );
        let ctx = ActorContext {
            catalog,
            persistence: Persistence::new(adapter, &config.persistence),
            sync,
            audit: Arc::new(audit),
            mailbox: config.mailbox(),
        };
        let registry = RegistryHandle::spawn(
            ctx.clone(),
            config.max_idle_containers,
            config.flush_interval(),
        );
        info!(
            flush_interval_ms = config.flush_interval_ms,
            threshold = config.full_resync_threshold,
            "stash server started"
        );
        Self {
            shared: Arc::new(Shared {
                config,
                ctx,
                producer,
                registry,
                inventories: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Attach a session: load its inventory and open its sync channel.
    ///
    /// A failed inventory load fails the connect.
    #[instrument(skip(self))]
    pub async fn connect(&self, session: SessionId) -> Result<(Session, SyncReceiver), ServerError> {
        if self
            .shared
            .inventories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session)
        {
            return Err(ServerError::AlreadyConnected(session));
        }

        let (sink, rx) = SyncSink::channel(session);
        self.shared.ctx.sync.register(session, sink).await;
        let inventory = match InventoryHandle::attach(session, self.shared.ctx.clone()).await {
            Ok(inventory) => inventory,
            Err(err) => {
                self.shared.ctx.sync.forget_session(session).await;
                return Err(err);
            }
        };
        self.shared
            .inventories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, inventory.clone());
        info!(%session, "session connected");

        let session = Session {
            id: session,
            inner: Some(SessionInner {
                inventory,
                containers: HashMap::new(),
                limiter: RateLimiter::from_config(&self.shared.config.rate_limit),
                shared: Arc::clone(&self.shared),
            }),
        };
        Ok((session, rx))
    }

    /// Deposit producer output into a connected session's inventory.
    ///
    /// Returns how much didn't fit.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        session: SessionId,
        item_id: ItemId,
        count: u32,
        action: ProducerAction,
    ) -> Result<u32, ServerError> {
        let inventory = self.shared.inventory(session)?;
        let grant = self.shared.producer.authorize(session, &action);
        inventory.add_item(item_id, count, grant).await
    }

    /// Consume exactly `count` of `item_id` from a session's inventory, or nothing.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        session: SessionId,
        item_id: ItemId,
        count: u32,
    ) -> Result<bool, ServerError> {
        let inventory = self.shared.inventory(session)?;
        inventory.remove_item(item_id, count).await
    }

    /// Copy of a connected session's inventory.
    pub async fn inventory(&self, session: SessionId) -> Result<Inventory, ServerError> {
        self.shared.inventory(session)?.snapshot().await
    }

    /// Copy of a resident container.
    pub async fn container(&self, key: ContainerKey) -> Result<Option<Container>, ServerError> {
        self.shared.registry.inspect(key).await
    }

    /// Keys of every container in memory.
    pub async fn resident_containers(&self) -> Result<Vec<ContainerKey>, ServerError> {
        self.shared.registry.resident().await
    }

    /// Flush pending sync messages now instead of waiting for the next tick.
    pub async fn flush(&self) {
        self.shared.ctx.sync.flush().await;
    }

    /// Run a maintenance pass (save and evict idle containers) now.
    pub async fn maintain(&self) -> Result<(), ServerError> {
        self.shared.registry.maintain().await
    }

    /// Persist and evict every container. Sessions should be disconnected first.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.flush().await;
        self.shared.registry.shutdown().await?;
        info!("stash server stopped");
        Ok(())
    }
}

struct SessionInner {
    inventory: InventoryHandle,
    containers: HashMap<ContainerKey, ContainerHandle>,
    limiter: RateLimiter,
    shared: Arc<Shared>,
}

impl SessionInner {
    /// Containers this session never opened stay invisible to it, resyncs included.
    fn ensure_viewing(&self, session: SessionId, location: LocationId) -> Result<(), ServerError> {
        match location {
            LocationId::Container(key) if !self.containers.contains_key(&key) => {
                warn!(%session, %key, "action on a container that is not open");
                Err(ServerError::UnknownLocation { session, location })
            }
            _ => Ok(()),
        }
    }
}

/// One connected client.
///
/// Dropping a session without calling [`Session::disconnect`] schedules the
/// same teardown on the runtime.
pub struct Session {
    id: SessionId,
    inner: Option<SessionInner>,
}

impl Session {
    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Containers this session has open.
    pub fn open_containers(&self) -> Vec<ContainerKey> {
        let mut keys: Vec<ContainerKey> = self
            .inner
            .as_ref()
            .map(|inner| inner.containers.keys().copied().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn inner(&mut self) -> Result<&mut SessionInner, ServerError> {
        let id = self.id;
        self.inner.as_mut().ok_or(ServerError::UnknownSession(id))
    }

    /// Verify and dispatch one client message.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn handle(&mut self, message: ClientMessage) -> Result<(), ServerError> {
        if let Err(reason) = message.verify() {
            let id = self.id;
            if let ClientMessage::Action(request) = &message {
                let inner = self.inner()?;
                inner.ensure_viewing(id, request.location)?;
                inner.shared.ctx.sync.request_full(id, request.location).await;
            }
            warn!(session = %id, reason, "invalid client message");
            return Err(ServerError::InvalidRequest(reason));
        }
        match message {
            ClientMessage::Open { key } => self.open(key).await,
            ClientMessage::Close { key } => self.close(key).await,
            ClientMessage::Action(request) => self.action(request).await,
            ClientMessage::Disconnect => {
                self.disconnect().await;
                Ok(())
            }
        }
    }

    /// Start viewing a container. A full sync follows on the next flush.
    pub async fn open(&mut self, key: ContainerKey) -> Result<(), ServerError> {
        let id = self.id;
        let inner = self.inner()?;
        let handle = inner.shared.registry.open(id, key).await?;
        inner.containers.insert(key, handle);
        debug!(session = %id, %key, "container opened");
        Ok(())
    }

    /// Click a slot.
    pub async fn action(&mut self, request: ActionRequest) -> Result<(), ServerError> {
        let id = self.id;
        let inner = self.inner()?;
        inner.ensure_viewing(id, request.location)?;
        if !inner.limiter.admit(Instant::now()) {
            inner.shared.ctx.audit.rate_limited(id, request.location);
            inner.shared.ctx.sync.request_full(id, request.location).await;
            return Err(ServerError::RateLimited(id));
        }

        let slot = usize::from(request.slot);
        match request.location {
            LocationId::Inventory => {
                inner
                    .inventory
                    .click(slot, request.kind, request.quantity)
                    .await
            }
            LocationId::Container(key) => match inner.containers.get(&key) {
                Some(container) => {
                    container
                        .click(id, slot, request.kind, request.quantity)
                        .await
                }
                None => Err(ServerError::UnknownLocation {
                    session: id,
                    location: request.location,
                }),
            },
        }
    }

    /// Stop viewing a container; its cursor drains into the inventory.
    pub async fn close(&mut self, key: ContainerKey) -> Result<(), ServerError> {
        let id = self.id;
        let inner = self.inner()?;
        let Some(container) = inner.containers.remove(&key) else {
            return Err(ServerError::UnknownLocation {
                session: id,
                location: LocationId::Container(key),
            });
        };
        container.close(id, inner.inventory.clone()).await
    }

    /// Close every open container, then persist and tear down the inventory.
    pub async fn disconnect(&mut self) {
        if let Some(inner) = self.inner.take() {
            teardown(self.id, inner).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(teardown(id, inner));
            }
            Err(_) => warn!(session = %id, "session dropped outside a runtime, teardown skipped"),
        }
    }
}

#[instrument(skip(inner))]
async fn teardown(session: SessionId, mut inner: SessionInner) {
    let mut keys: BTreeSet<ContainerKey> = inner.containers.keys().copied().collect();
    match inner.shared.registry.open_keys(session).await {
        Ok(registered) => keys.extend(registered),
        Err(err) => warn!(%session, %err, "registry unavailable during disconnect"),
    }
    for key in keys {
        let handle = match inner.containers.remove(&key) {
            Some(handle) => handle,
            // Re-opening is idempotent and yields a handle to close with.
            None => match inner.shared.registry.open(session, key).await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(%session, %key, %err, "container unreachable during disconnect");
                    continue;
                }
            },
        };
        if let Err(err) = handle.close(session, inner.inventory.clone()).await {
            warn!(%session, %key, %err, "close during disconnect failed");
        }
    }

    if let Err(err) = inner.inventory.teardown().await {
        warn!(%session, %err, "inventory teardown failed");
    }
    inner
        .shared
        .inventories
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&session);
    inner.shared.ctx.sync.forget_session(session).await;
    info!(%session, "session disconnected");
}
