//! Per-session inventory actor.
//!
//! Owns one [`Inventory`] and its cursor. The actor never calls container
//! actors; containers call it while draining a cursor on close.

use crate::audit::AuditLog;
use crate::error::ServerError;
use crate::persistence::Persistence;
use crate::sync::{MirrorKey, SyncCommit, SyncHandle};
use mdstash_core::{ActionKind, ItemCatalog, ItemId, LocationId, SessionId, Stack};
use mdstash_world::{EmptySaveGuard, Inventory, ProducerGrant, SnapshotKey};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

type Reply<T> = oneshot::Sender<Result<T, ServerError>>;

enum InventoryCommand {
    Click {
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
        reply: Reply<()>,
    },
    AddItem {
        item_id: ItemId,
        count: u32,
        grant: ProducerGrant,
        reply: Reply<u32>,
    },
    RemoveItem {
        item_id: ItemId,
        count: u32,
        reply: oneshot::Sender<bool>,
    },
    Absorb {
        stack: Stack,
        reply: oneshot::Sender<Stack>,
    },
    Snapshot {
        reply: oneshot::Sender<Inventory>,
    },
    Teardown {
        reply: Reply<()>,
    },
}

/// Everything an actor needs besides its own state.
#[derive(Clone)]
pub struct ActorContext {
    /// Item capacities.
    pub catalog: Arc<dyn ItemCatalog>,
    /// Snapshot storage with retries.
    pub persistence: Persistence,
    /// Sync scheduler.
    pub sync: SyncHandle,
    /// Rejection audit.
    pub audit: Arc<AuditLog>,
    /// Mailbox size for spawned actors.
    pub mailbox: usize,
}

/// Handle to one session's inventory actor.
#[derive(Clone)]
pub struct InventoryHandle {
    session: SessionId,
    tx: mpsc::Sender<InventoryCommand>,
}

impl InventoryHandle {
    /// Load (or create) the inventory for `session` and start its actor.
    ///
    /// A failed load fails the attach; nothing is substituted.
    pub async fn attach(session: SessionId, ctx: ActorContext) -> Result<Self, ServerError> {
        let key = SnapshotKey::Inventory(session);
        let snapshot = ctx.persistence.load(key).await?;
        let guard = EmptySaveGuard::after_load(snapshot.as_ref());
        let inventory = match snapshot {
            Some(snapshot) => Inventory::from_snapshot(&snapshot, ctx.catalog.as_ref()),
            None => Inventory::new(),
        };
        ctx.sync
            .attach(MirrorKey::Inventory(session), inventory.slots().to_vec())
            .await;
        ctx.sync
            .set_cursor(session, LocationId::Inventory, inventory.cursor())
            .await;
        ctx.sync.request_full(session, LocationId::Inventory).await;

        let (tx, rx) = mpsc::channel(ctx.mailbox);
        let actor = InventoryActor {
            session,
            inventory,
            guard,
            ctx,
            rx,
        };
        tokio::spawn(actor.run());
        debug!(%session, "inventory attached");
        Ok(Self { session, tx })
    }

    /// Session owning this inventory.
    pub fn session(&self) -> SessionId {
        self.session
    }

    async fn request<T>(
        &self,
        command: InventoryCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ServerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> ServerError {
        ServerError::ActorGone(format!("inventory {}", self.session))
    }

    /// Click one of the inventory's own slots.
    pub async fn click(
        &self,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
    ) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            InventoryCommand::Click {
                slot,
                kind,
                quantity,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Producer deposit; returns what didn't fit.
    pub async fn add_item(
        &self,
        item_id: ItemId,
        count: u32,
        grant: ProducerGrant,
    ) -> Result<u32, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            InventoryCommand::AddItem {
                item_id,
                count,
                grant,
                reply,
            },
            rx,
        )
        .await?
    }

    /// All-or-nothing consumption.
    pub async fn remove_item(&self, item_id: ItemId, count: u32) -> Result<bool, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            InventoryCommand::RemoveItem {
                item_id,
                count,
                reply,
            },
            rx,
        )
        .await
    }

    /// Take in a drained cursor; returns the part that didn't fit.
    pub async fn absorb(&self, stack: Stack) -> Result<Stack, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(InventoryCommand::Absorb { stack, reply }, rx)
            .await
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> Result<Inventory, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(InventoryCommand::Snapshot { reply }, rx).await
    }

    /// Drain the cursor, persist and stop the actor.
    ///
    /// A save that keeps failing is parked in [`Persistence`], never dropped.
    pub async fn teardown(&self) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(InventoryCommand::Teardown { reply }, rx)
            .await?
    }
}

struct InventoryActor {
    session: SessionId,
    inventory: Inventory,
    guard: EmptySaveGuard,
    ctx: ActorContext,
    rx: mpsc::Receiver<InventoryCommand>,
}

impl InventoryActor {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                InventoryCommand::Click {
                    slot,
                    kind,
                    quantity,
                    reply,
                } => {
                    let result = self.click(slot, kind, quantity).await;
                    let _ = reply.send(result);
                }
                InventoryCommand::AddItem {
                    item_id,
                    count,
                    grant,
                    reply,
                } => {
                    let result = self.add_item(item_id, count, &grant).await;
                    let _ = reply.send(result);
                }
                InventoryCommand::RemoveItem {
                    item_id,
                    count,
                    reply,
                } => {
                    let removed = self.remove_item(item_id, count).await;
                    let _ = reply.send(removed);
                }
                InventoryCommand::Absorb { stack, reply } => {
                    let leftover = self.absorb(stack).await;
                    let _ = reply.send(leftover);
                }
                InventoryCommand::Snapshot { reply } => {
                    let _ = reply.send(self.inventory.clone());
                }
                InventoryCommand::Teardown { reply } => {
                    let result = self.teardown().await;
                    let _ = reply.send(result);
                    break;
                }
            }
        }
        debug!(session = %self.session, "inventory actor stopped");
    }

    async fn click(
        &mut self,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
    ) -> Result<(), ServerError> {
        let location = LocationId::Inventory;
        match self
            .inventory
            .click(slot, kind, quantity, self.ctx.catalog.as_ref())
        {
            Ok(commit) if commit.is_noop() => Ok(()),
            Ok(commit) => {
                self.publish(commit.changes, Some(commit.cursor)).await;
                Ok(())
            }
            Err(err) => {
                let err = ServerError::from_click(err, self.session, location);
                if let ServerError::Validation(failure) = &err {
                    self.ctx.audit.rejected(self.session, location, failure);
                }
                if err.forces_resync() {
                    self.ctx.sync.request_full(self.session, location).await;
                }
                Err(err)
            }
        }
    }

    async fn add_item(
        &mut self,
        item_id: ItemId,
        count: u32,
        grant: &ProducerGrant,
    ) -> Result<u32, ServerError> {
        match self
            .inventory
            .add_item(item_id, count, grant, self.ctx.catalog.as_ref())
        {
            Ok((leftover, changes)) => {
                self.publish(changes, None).await;
                Ok(leftover)
            }
            Err(failure) => {
                self.ctx
                    .audit
                    .rejected(self.session, LocationId::Inventory, &failure);
                Err(ServerError::Validation(failure))
            }
        }
    }

    async fn remove_item(&mut self, item_id: ItemId, count: u32) -> bool {
        match self
            .inventory
            .remove_item(item_id, count, self.ctx.catalog.as_ref())
        {
            Some(changes) => {
                self.publish(changes, None).await;
                true
            }
            None => false,
        }
    }

    async fn absorb(&mut self, stack: Stack) -> Stack {
        match self.inventory.absorb(stack, self.ctx.catalog.as_ref()) {
            Ok((leftover, changes)) => {
                self.publish(changes, None).await;
                leftover
            }
            Err(failure) => {
                warn!(session = %self.session, %failure, "absorb rejected, stack handed back");
                stack
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), ServerError> {
        let changes = self.inventory.drain_cursor(self.ctx.catalog.as_ref());
        if !changes.is_empty() {
            self.guard.record_change();
            debug!(session = %self.session, "cursor drained into inventory");
        }
        let snapshot = self.inventory.snapshot();
        if !self.guard.allows(&snapshot) {
            warn!(session = %self.session, "stored inventory kept, nothing committed emptied it");
            return Ok(());
        }
        let key = SnapshotKey::Inventory(self.session);
        let result = self.ctx.persistence.save_or_park(key, snapshot).await;
        if let Err(err) = &result {
            error!(session = %self.session, %err, "final inventory save failed, retried on maintenance");
        }
        result
    }

    async fn publish(&mut self, changes: Vec<(usize, Stack)>, cursor: Option<Stack>) {
        if changes.is_empty() && cursor.is_none() {
            return;
        }
        self.guard.record_change();
        self.ctx
            .sync
            .commit(SyncCommit {
                actor: self.session,
                location: LocationId::Inventory,
                changes,
                cursor,
                audience: vec![self.session],
            })
            .await;
    }
}
