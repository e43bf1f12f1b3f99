//! Container registry actor.
//!
//! Maps container keys to actor handles and sessions to the keys they have
//! open, both as plain ids. Containers are spawned on first reference and
//! evicted once unviewed and saved.

use crate::container::{ContainerCommand, ContainerHandle, EvictOutcome};
use crate::error::ServerError;
use crate::inventory::ActorContext;
use mdstash_core::{ContainerKey, SessionId};
use mdstash_world::Container;
use lru::LruCache;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Notifications from container actors. Sent without waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegistryEvent {
    Opened {
        session: SessionId,
        key: ContainerKey,
    },
    Closed {
        session: SessionId,
        key: ContainerKey,
        unviewed: bool,
    },
    LoadFailed {
        key: ContainerKey,
        generation: u64,
    },
}

enum RegistryCommand {
    Open {
        session: SessionId,
        key: ContainerKey,
        reply: oneshot::Sender<Result<ContainerHandle, ServerError>>,
    },
    OpenKeys {
        session: SessionId,
        reply: oneshot::Sender<Vec<ContainerKey>>,
    },
    Inspect {
        key: ContainerKey,
        reply: oneshot::Sender<Option<Container>>,
    },
    Resident {
        reply: oneshot::Sender<Vec<ContainerKey>>,
    },
    Maintain {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry; maintenance runs every `interval`.
    pub fn spawn(ctx: ActorContext, max_idle: usize, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(ctx.mailbox);
        let (events_tx, events) = mpsc::unbounded_channel();
        let actor = RegistryActor {
            ctx,
            max_idle,
            containers: HashMap::new(),
            open_keys: HashMap::new(),
            idle: LruCache::unbounded(),
            next_generation: 0,
            events_tx,
            events,
            rx,
        };
        tokio::spawn(actor.run(interval));
        Self { tx }
    }

    fn gone() -> ServerError {
        ServerError::ActorGone("registry".to_string())
    }

    async fn request<T>(
        &self,
        command: RegistryCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ServerError> {
        self.tx.send(command).await.map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())
    }

    /// Add `session` as a viewer of `key`, loading the container if needed.
    pub async fn open(
        &self,
        session: SessionId,
        key: ContainerKey,
    ) -> Result<ContainerHandle, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Open {
                session,
                key,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Keys `session` currently has open.
    pub async fn open_keys(&self, session: SessionId) -> Result<Vec<ContainerKey>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::OpenKeys { session, reply }, rx)
            .await
    }

    /// Copy of a resident container, without loading it.
    pub async fn inspect(&self, key: ContainerKey) -> Result<Option<Container>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Inspect { key, reply }, rx)
            .await
    }

    /// Keys of every container in memory.
    pub async fn resident(&self) -> Result<Vec<ContainerKey>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Resident { reply }, rx).await
    }

    /// Run one maintenance pass now.
    pub async fn maintain(&self) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Maintain { reply }, rx).await
    }

    /// Save and evict every unviewed container, then stop.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Shutdown { reply }, rx).await
    }
}

struct Resident {
    handle: ContainerHandle,
    generation: u64,
}

struct RegistryActor {
    ctx: ActorContext,
    max_idle: usize,
    containers: HashMap<ContainerKey, Resident>,
    open_keys: HashMap<SessionId, BTreeSet<ContainerKey>>,
    idle: LruCache<ContainerKey, ()>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    events: mpsc::UnboundedReceiver<RegistryEvent>,
    rx: mpsc::Receiver<RegistryCommand>,
}

impl RegistryActor {
    async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(event),
                command = self.rx.recv() => match command {
                    Some(RegistryCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => self.maintain().await,
            }
        }
        debug!("registry stopped");
    }

    fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Opened { session, key } => {
                self.open_keys.entry(session).or_default().insert(key);
                self.idle.pop(&key);
            }
            RegistryEvent::Closed {
                session,
                key,
                unviewed,
            } => {
                if let Some(keys) = self.open_keys.get_mut(&session) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.open_keys.remove(&session);
                    }
                }
                if unviewed {
                    self.idle.put(key, ());
                }
            }
            RegistryEvent::LoadFailed { key, generation } => {
                if self
                    .containers
                    .get(&key)
                    .is_some_and(|resident| resident.generation == generation)
                {
                    self.containers.remove(&key);
                    self.idle.pop(&key);
                }
            }
        }
    }

    async fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Open {
                session,
                key,
                reply,
            } => self.open(session, key, reply).await,
            RegistryCommand::OpenKeys { session, reply } => {
                let keys = self
                    .open_keys
                    .get(&session)
                    .map(|keys| keys.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(keys);
            }
            RegistryCommand::Inspect { key, reply } => {
                let container = match self.containers.get(&key) {
                    Some(resident) => resident.handle.inspect().await.ok(),
                    None => None,
                };
                let _ = reply.send(container);
            }
            RegistryCommand::Resident { reply } => {
                let mut keys: Vec<ContainerKey> = self.containers.keys().copied().collect();
                keys.sort();
                let _ = reply.send(keys);
            }
            RegistryCommand::Maintain { reply } => {
                self.maintain().await;
                let _ = reply.send(());
            }
            RegistryCommand::Shutdown { .. } => {}
        }
    }

    async fn open(
        &mut self,
        session: SessionId,
        key: ContainerKey,
        reply: oneshot::Sender<Result<ContainerHandle, ServerError>>,
    ) {
        let handle = self.resident_or_spawn(key);
        let Err(mpsc::error::SendError(command)) = handle
            .send(ContainerCommand::Open { session, reply })
            .await
        else {
            return;
        };

        // The actor stopped after a failed load; try a fresh one once.
        self.containers.remove(&key);
        let handle = self.resident_or_spawn(key);
        if let Err(mpsc::error::SendError(command)) = handle.send(command).await {
            command_gone(command, key);
        }
    }

    fn resident_or_spawn(&mut self, key: ContainerKey) -> ContainerHandle {
        if let Some(resident) = self.containers.get(&key) {
            return resident.handle.clone();
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = ContainerHandle::spawn(key, generation, self.ctx.clone(), self.events_tx.clone());
        debug!(%key, generation, "container spawned");
        self.containers.insert(
            key,
            Resident {
                handle: handle.clone(),
                generation,
            },
        );
        handle
    }

    async fn maintain(&mut self) {
        self.ctx.audit.flush();
        self.ctx.persistence.retry_parked().await;

        let mut retry = Vec::new();
        while self.idle.len() > self.max_idle {
            let Some((key, ())) = self.idle.pop_lru() else {
                break;
            };
            if self.evict(key).await == EvictOutcome::SaveFailed {
                retry.push(key);
            }
        }
        for key in retry {
            self.idle.put(key, ());
        }

        let idle: Vec<ContainerKey> = self.idle.iter().map(|(key, ())| *key).collect();
        for key in idle {
            if let Some(resident) = self.containers.get(&key) {
                let _ = resident.handle.send(ContainerCommand::Save).await;
            }
        }
    }

    async fn evict(&mut self, key: ContainerKey) -> EvictOutcome {
        let Some(resident) = self.containers.get(&key) else {
            return EvictOutcome::Gone;
        };
        let (reply, rx) = oneshot::channel();
        let outcome = match resident.handle.send(ContainerCommand::Evict { reply }).await {
            Ok(()) => rx.await.unwrap_or(EvictOutcome::Gone),
            Err(_) => EvictOutcome::Gone,
        };
        match outcome {
            EvictOutcome::Evicted | EvictOutcome::Gone => {
                self.containers.remove(&key);
                self.ctx.sync.detach_container(key).await;
                info!(%key, "container evicted");
            }
            EvictOutcome::Viewed => debug!(%key, "container viewed again, kept"),
            EvictOutcome::SaveFailed => warn!(%key, "container kept resident after failed save"),
        }
        outcome
    }

    async fn shutdown(&mut self) {
        let keys: Vec<ContainerKey> = self.containers.keys().copied().collect();
        for key in keys {
            match self.evict(key).await {
                EvictOutcome::Evicted | EvictOutcome::Gone => {}
                outcome => warn!(%key, ?outcome, "container still resident at shutdown"),
            }
        }
        self.ctx.persistence.retry_parked().await;
        for key in self.ctx.persistence.parked().await {
            error!(%key, "snapshot still unsaved at shutdown");
        }
        self.ctx.audit.flush();
    }
}

fn command_gone(command: ContainerCommand, key: ContainerKey) {
    if let ContainerCommand::Open { reply, .. } = command {
        let _ = reply.send(Err(ServerError::ActorGone(format!("container {key}"))));
    }
}
