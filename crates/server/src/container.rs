//! Per-container actor.
//!
//! Every action for one key runs inside this actor in arrival order. The
//! actor loads its snapshot before serving anything; a failed load answers
//! every queued request with the failure and stops.

use crate::error::ServerError;
use crate::inventory::{ActorContext, InventoryHandle};
use crate::registry::RegistryEvent;
use crate::sync::{MirrorKey, SyncCommit};
use mdstash_core::{ActionKind, ContainerKey, LocationId, SessionId, Stack};
use mdstash_net::ServerMessage;
use mdstash_world::{Container, SnapshotKey};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Reply<T> = oneshot::Sender<Result<T, ServerError>>;

pub(crate) enum ContainerCommand {
    Open {
        session: SessionId,
        reply: Reply<ContainerHandle>,
    },
    Click {
        session: SessionId,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
        reply: Reply<()>,
    },
    Close {
        session: SessionId,
        inventory: InventoryHandle,
        reply: Reply<()>,
    },
    Save,
    Evict {
        reply: oneshot::Sender<EvictOutcome>,
    },
    Inspect {
        reply: oneshot::Sender<Container>,
    },
}

impl ContainerCommand {
    fn fail(self, err: ServerError) {
        match self {
            ContainerCommand::Open { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            ContainerCommand::Click { reply, .. } | ContainerCommand::Close { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            ContainerCommand::Evict { reply } => {
                let _ = reply.send(EvictOutcome::Gone);
            }
            ContainerCommand::Save | ContainerCommand::Inspect { .. } => {}
        }
    }
}

/// Result of asking a container to leave memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictOutcome {
    /// Saved (if needed) and stopped.
    Evicted,
    /// Someone is viewing it again.
    Viewed,
    /// The save failed; the container stays resident.
    SaveFailed,
    /// The actor had already stopped.
    Gone,
}

/// Handle to one container actor.
#[derive(Clone)]
pub struct ContainerHandle {
    key: ContainerKey,
    tx: mpsc::Sender<ContainerCommand>,
}

impl ContainerHandle {
    pub(crate) fn spawn(
        key: ContainerKey,
        generation: u64,
        ctx: ActorContext,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(ctx.mailbox);
        let handle = Self { key, tx };
        let actor = ContainerActor {
            key,
            generation,
            handle: handle.clone(),
            ctx,
            events,
            rx,
        };
        tokio::spawn(actor.run());
        handle
    }

    /// Key of the container.
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    fn gone(&self) -> ServerError {
        ServerError::ActorGone(format!("container {}", self.key))
    }

    pub(crate) async fn send(
        &self,
        command: ContainerCommand,
    ) -> Result<(), mpsc::error::SendError<ContainerCommand>> {
        self.tx.send(command).await
    }

    async fn request<T>(
        &self,
        command: ContainerCommand,
        rx: oneshot::Receiver<Result<T, ServerError>>,
    ) -> Result<T, ServerError> {
        self.tx.send(command).await.map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Click a slot as `session`.
    pub async fn click(
        &self,
        session: SessionId,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
    ) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            ContainerCommand::Click {
                session,
                slot,
                kind,
                quantity,
                reply,
            },
            rx,
        )
        .await
    }

    /// Stop viewing; the cursor drains into `inventory` first.
    pub async fn close(
        &self,
        session: SessionId,
        inventory: InventoryHandle,
    ) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            ContainerCommand::Close {
                session,
                inventory,
                reply,
            },
            rx,
        )
        .await
    }

    /// Copy of the container state.
    pub async fn inspect(&self) -> Result<Container, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ContainerCommand::Inspect { reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }
}

struct ContainerActor {
    key: ContainerKey,
    generation: u64,
    handle: ContainerHandle,
    ctx: ActorContext,
    events: mpsc::UnboundedSender<RegistryEvent>,
    rx: mpsc::Receiver<ContainerCommand>,
}

impl ContainerActor {
    async fn run(mut self) {
        let snapshot_key = SnapshotKey::Container(self.key);
        let mut container = match self.ctx.persistence.load(snapshot_key).await {
            Ok(Some(snapshot)) => {
                Container::from_snapshot(self.key, &snapshot, self.ctx.catalog.as_ref())
            }
            Ok(None) => Container::new(self.key),
            Err(err) => {
                warn!(key = %self.key, %err, "container load failed");
                self.rx.close();
                while let Some(command) = self.rx.recv().await {
                    command.fail(err.clone());
                }
                let _ = self.events.send(RegistryEvent::LoadFailed {
                    key: self.key,
                    generation: self.generation,
                });
                return;
            }
        };
        self.ctx
            .sync
            .attach(MirrorKey::Container(self.key), container.slots().to_vec())
            .await;
        debug!(key = %self.key, "container loaded");

        while let Some(command) = self.rx.recv().await {
            match command {
                ContainerCommand::Open { session, reply } => {
                    self.open(&mut container, session).await;
                    let _ = reply.send(Ok(self.handle.clone()));
                }
                ContainerCommand::Click {
                    session,
                    slot,
                    kind,
                    quantity,
                    reply,
                } => {
                    let result = self
                        .click(&mut container, session, slot, kind, quantity)
                        .await;
                    let _ = reply.send(result);
                }
                ContainerCommand::Close {
                    session,
                    inventory,
                    reply,
                } => {
                    let result = self.close(&mut container, session, inventory).await;
                    let _ = reply.send(result);
                }
                ContainerCommand::Save => {
                    self.save(&mut container).await;
                }
                ContainerCommand::Evict { reply } => {
                    let outcome = if !container.is_evictable() {
                        EvictOutcome::Viewed
                    } else if self.save(&mut container).await {
                        EvictOutcome::Evicted
                    } else {
                        EvictOutcome::SaveFailed
                    };
                    let _ = reply.send(outcome);
                    if outcome == EvictOutcome::Evicted {
                        break;
                    }
                }
                ContainerCommand::Inspect { reply } => {
                    let _ = reply.send(container.clone());
                }
            }
        }
        debug!(key = %self.key, "container actor stopped");
    }

    fn location(&self) -> LocationId {
        LocationId::Container(self.key)
    }

    async fn open(&self, container: &mut Container, session: SessionId) {
        if container.open(session) {
            debug!(key = %self.key, %session, viewers = container.viewer_count(), "viewer joined");
        }
        let location = self.location();
        let cursor = container.cursor(session).unwrap_or(Stack::EMPTY);
        self.ctx.sync.set_cursor(session, location, cursor).await;
        self.ctx.sync.request_full(session, location).await;
        let _ = self.events.send(RegistryEvent::Opened {
            session,
            key: self.key,
        });
    }

    async fn click(
        &self,
        container: &mut Container,
        session: SessionId,
        slot: usize,
        kind: ActionKind,
        quantity: Option<u32>,
    ) -> Result<(), ServerError> {
        let location = self.location();
        match container.click(session, slot, kind, quantity, self.ctx.catalog.as_ref()) {
            Ok(commit) if commit.is_noop() => Ok(()),
            Ok(commit) => {
                self.ctx
                    .sync
                    .commit(SyncCommit {
                        actor: session,
                        location,
                        changes: commit.changes,
                        cursor: Some(commit.cursor),
                        audience: container.viewers().collect(),
                    })
                    .await;
                Ok(())
            }
            Err(err) => {
                let err = ServerError::from_click(err, session, location);
                if let ServerError::Validation(failure) = &err {
                    self.ctx.audit.rejected(session, location, failure);
                }
                if err.forces_resync() {
                    self.ctx.sync.request_full(session, location).await;
                }
                Err(err)
            }
        }
    }

    async fn close(
        &self,
        container: &mut Container,
        session: SessionId,
        inventory: InventoryHandle,
    ) -> Result<(), ServerError> {
        let location = self.location();
        if !container.is_viewer(session) {
            return Err(ServerError::UnknownLocation { session, location });
        }

        let held = container.take_cursor(session);
        let leftover = if held.is_empty() {
            Stack::EMPTY
        } else {
            match inventory.absorb(held).await {
                Ok(leftover) => leftover,
                Err(err) => {
                    warn!(key = %self.key, %session, %err, "inventory unavailable, cursor returned to container");
                    held
                }
            }
        };
        let catalog = self.ctx.catalog.as_ref();
        let mut changes = container.force_deposit(leftover, catalog);
        let (rest, unviewed) = container.close(session, catalog);
        changes.extend(rest);

        if !changes.is_empty() {
            self.ctx
                .sync
                .commit(SyncCommit {
                    actor: session,
                    location,
                    changes,
                    cursor: None,
                    audience: container.viewers().collect(),
                })
                .await;
        }
        self.ctx.sync.close_view(session, location).await;
        self.ctx
            .sync
            .push(session, ServerMessage::CloseAck { key: self.key })
            .await;
        let _ = self.events.send(RegistryEvent::Closed {
            session,
            key: self.key,
            unviewed,
        });
        debug!(key = %self.key, %session, unviewed, "viewer left");
        Ok(())
    }

    /// Persist if anything changed. Returns false when the save failed.
    async fn save(&self, container: &mut Container) -> bool {
        if !container.needs_save() {
            return true;
        }
        let key = SnapshotKey::Container(self.key);
        match self.ctx.persistence.save(key, container.snapshot()).await {
            Ok(()) => {
                container.mark_saved();
                true
            }
            Err(err) => {
                warn!(key = %self.key, %err, "container save failed, will retry");
                false
            }
        }
    }
}
