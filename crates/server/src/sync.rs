//! Dirty tracking and batched sync emission.
//!
//! [`SyncScheduler`] is a pure state machine: actors report commits, the
//! scheduler mirrors authoritative slot state and remembers what each session
//! has not seen yet. [`SyncScheduler::flush`] turns that into at most one
//! message per (session, location). The actor wrapper drives flushes from a
//! `tokio::time::interval` and pushes messages through per-session channels.

use mdstash_core::{ContainerKey, LocationId, SessionId, Stack};
use mdstash_net::{ServerMessage, SlotChange, SyncMessage};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Whose slots a mirror holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MirrorKey {
    /// One session's private inventory.
    Inventory(SessionId),
    /// A shared container.
    Container(ContainerKey),
}

impl MirrorKey {
    /// Mirror backing `location` as seen by `session`.
    pub fn for_location(session: SessionId, location: LocationId) -> Self {
        match location {
            LocationId::Inventory => MirrorKey::Inventory(session),
            LocationId::Container(key) => MirrorKey::Container(key),
        }
    }
}

/// One committed mutation as reported by an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCommit {
    /// Session whose action produced the commit.
    pub actor: SessionId,
    /// Location as the actor names it.
    pub location: LocationId,
    /// Changed slots with their new values.
    pub changes: Vec<(usize, Stack)>,
    /// Acting session's cursor after the commit, when it may have changed.
    pub cursor: Option<Stack>,
    /// Every session that must see the change, the actor included.
    pub audience: Vec<SessionId>,
}

#[derive(Debug, Default)]
struct PendingLocation {
    dirty: BTreeMap<usize, Stack>,
    cursor: Option<Stack>,
    full: bool,
}

/// Pure dirty-tracking state.
#[derive(Debug)]
pub struct SyncScheduler {
    threshold: usize,
    mirrors: HashMap<MirrorKey, Vec<Stack>>,
    cursors: HashMap<(SessionId, LocationId), Stack>,
    pending: BTreeMap<SessionId, BTreeMap<LocationId, PendingLocation>>,
}

impl SyncScheduler {
    /// Create a scheduler that switches to full snapshots above `threshold` dirty slots.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            mirrors: HashMap::new(),
            cursors: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Register the authoritative slots of a location.
    pub fn attach(&mut self, key: MirrorKey, slots: Vec<Stack>) {
        self.mirrors.insert(key, slots);
    }

    /// Mirror of a location's slots.
    pub fn mirror(&self, key: MirrorKey) -> Option<&[Stack]> {
        self.mirrors.get(&key).map(Vec::as_slice)
    }

    /// Apply a commit to the mirror and mark every audience member dirty.
    pub fn commit(&mut self, commit: SyncCommit) {
        let key = MirrorKey::for_location(commit.actor, commit.location);
        match self.mirrors.get_mut(&key) {
            Some(mirror) => {
                for (index, stack) in &commit.changes {
                    if let Some(slot) = mirror.get_mut(*index) {
                        *slot = *stack;
                    }
                }
            }
            None => debug!(?key, "commit for unattached location"),
        }

        if let Some(cursor) = commit.cursor {
            self.cursors.insert((commit.actor, commit.location), cursor);
            self.pending_for(commit.actor, commit.location).cursor = Some(cursor);
        }
        for session in commit.audience {
            let pending = self.pending_for(session, commit.location);
            for (index, stack) in &commit.changes {
                pending.dirty.insert(*index, *stack);
            }
        }
    }

    /// Force the next flush to send `location` to `session` as a full snapshot.
    pub fn request_full(&mut self, session: SessionId, location: LocationId) {
        self.pending_for(session, location).full = true;
    }

    /// Record a session's cursor without marking anything dirty.
    pub fn set_cursor(&mut self, session: SessionId, location: LocationId, cursor: Stack) {
        self.cursors.insert((session, location), cursor);
    }

    /// Drop everything pending for a session's view of `location`.
    pub fn close_view(&mut self, session: SessionId, location: LocationId) {
        self.cursors.remove(&(session, location));
        if let Some(locations) = self.pending.get_mut(&session) {
            locations.remove(&location);
        }
    }

    /// Drop all state for a disconnected session.
    pub fn forget_session(&mut self, session: SessionId) {
        self.pending.remove(&session);
        self.mirrors.remove(&MirrorKey::Inventory(session));
        self.cursors.retain(|(owner, _), _| *owner != session);
    }

    /// Drop the mirror of an evicted container.
    pub fn detach_container(&mut self, key: ContainerKey) {
        self.mirrors.remove(&MirrorKey::Container(key));
    }

    /// Returns true when a flush would emit something.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Emit one message per dirty (session, location) and clear pending state.
    pub fn flush(&mut self) -> Vec<(SessionId, SyncMessage)> {
        let mut out = Vec::new();
        for (session, locations) in std::mem::take(&mut self.pending) {
            for (location, pending) in locations {
                if let Some(message) = self.message_for(session, location, pending) {
                    out.push((session, message));
                }
            }
        }
        out
    }

    /// Emit pending state for one session only.
    pub fn flush_session(&mut self, session: SessionId) -> Vec<SyncMessage> {
        let Some(locations) = self.pending.remove(&session) else {
            return Vec::new();
        };
        locations
            .into_iter()
            .filter_map(|(location, pending)| self.message_for(session, location, pending))
            .collect()
    }

    fn message_for(
        &self,
        session: SessionId,
        location: LocationId,
        pending: PendingLocation,
    ) -> Option<SyncMessage> {
        if pending.full || pending.dirty.len() > self.threshold {
            let key = MirrorKey::for_location(session, location);
            let Some(slots) = self.mirrors.get(&key) else {
                debug!(%session, %location, "full sync skipped, location not attached");
                return None;
            };
            let cursor = self
                .cursors
                .get(&(session, location))
                .copied()
                .unwrap_or(Stack::EMPTY);
            return Some(SyncMessage::Full {
                location,
                slots: slots.clone(),
                cursor,
            });
        }
        if pending.dirty.is_empty() && pending.cursor.is_none() {
            return None;
        }
        let changes = pending
            .dirty
            .into_iter()
            .filter_map(|(slot, stack)| u16::try_from(slot).ok().map(|slot| SlotChange { slot, stack }))
            .collect();
        Some(SyncMessage::Delta {
            location,
            changes,
            cursor: pending.cursor,
        })
    }

    fn pending_for(&mut self, session: SessionId, location: LocationId) -> &mut PendingLocation {
        self.pending
            .entry(session)
            .or_default()
            .entry(location)
            .or_default()
    }
}

/// Receiving end of a session's outbound channel.
pub type SyncReceiver = mpsc::UnboundedReceiver<ServerMessage>;

/// Fire-and-forget outbound channel for one session.
#[derive(Debug, Clone)]
pub struct SyncSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl SyncSink {
    /// Create a sink and the receiver handed to the connection.
    pub fn channel(session: SessionId) -> (Self, SyncReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { session, tx }, rx)
    }

    /// Send without waiting. A closed receiver is ignored.
    pub fn send(&self, message: ServerMessage) {
        if self.tx.send(message).is_err() {
            debug!(session = %self.session, "sync receiver closed, message dropped");
        }
    }
}

enum SyncCommand {
    Register { session: SessionId, sink: SyncSink },
    Attach { key: MirrorKey, slots: Vec<Stack> },
    Commit(SyncCommit),
    RequestFull { session: SessionId, location: LocationId },
    SetCursor { session: SessionId, location: LocationId, cursor: Stack },
    CloseView { session: SessionId, location: LocationId },
    Push { session: SessionId, message: ServerMessage },
    ForgetSession(SessionId),
    DetachContainer(ContainerKey),
    Flush(oneshot::Sender<()>),
}

/// Handle to the scheduler actor.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Spawn the scheduler actor on the current runtime.
    pub fn spawn(threshold: usize, flush_interval: Duration, mailbox: usize) -> Self {
        let (tx, rx) = mpsc::channel(mailbox);
        let actor = SyncActor {
            scheduler: SyncScheduler::new(threshold),
            sinks: HashMap::new(),
            rx,
        };
        tokio::spawn(actor.run(flush_interval));
        Self { tx }
    }

    async fn send(&self, command: SyncCommand) {
        if self.tx.send(command).await.is_err() {
            debug!("sync scheduler stopped, command dropped");
        }
    }

    /// Route flushed messages for `session` to `sink`.
    pub async fn register(&self, session: SessionId, sink: SyncSink) {
        self.send(SyncCommand::Register { session, sink }).await;
    }

    /// See [`SyncScheduler::attach`].
    pub async fn attach(&self, key: MirrorKey, slots: Vec<Stack>) {
        self.send(SyncCommand::Attach { key, slots }).await;
    }

    /// See [`SyncScheduler::commit`].
    pub async fn commit(&self, commit: SyncCommit) {
        self.send(SyncCommand::Commit(commit)).await;
    }

    /// See [`SyncScheduler::request_full`].
    pub async fn request_full(&self, session: SessionId, location: LocationId) {
        self.send(SyncCommand::RequestFull { session, location }).await;
    }

    /// See [`SyncScheduler::set_cursor`].
    pub async fn set_cursor(&self, session: SessionId, location: LocationId, cursor: Stack) {
        self.send(SyncCommand::SetCursor {
            session,
            location,
            cursor,
        })
        .await;
    }

    /// See [`SyncScheduler::close_view`].
    pub async fn close_view(&self, session: SessionId, location: LocationId) {
        self.send(SyncCommand::CloseView { session, location }).await;
    }

    /// Deliver `message` after anything already pending for the session.
    pub async fn push(&self, session: SessionId, message: ServerMessage) {
        self.send(SyncCommand::Push { session, message }).await;
    }

    /// See [`SyncScheduler::forget_session`]; also drops the session's sink.
    pub async fn forget_session(&self, session: SessionId) {
        self.send(SyncCommand::ForgetSession(session)).await;
    }

    /// See [`SyncScheduler::detach_container`].
    pub async fn detach_container(&self, key: ContainerKey) {
        self.send(SyncCommand::DetachContainer(key)).await;
    }

    /// Flush now and wait until every message has been handed to its sink.
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        self.send(SyncCommand::Flush(reply)).await;
        let _ = done.await;
    }
}

struct SyncActor {
    scheduler: SyncScheduler,
    sinks: HashMap<SessionId, SyncSink>,
    rx: mpsc::Receiver<SyncCommand>,
}

impl SyncActor {
    async fn run(mut self, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => self.flush(),
            }
        }
        debug!("sync scheduler stopped");
    }

    fn handle(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Register { session, sink } => {
                self.sinks.insert(session, sink);
            }
            SyncCommand::Attach { key, slots } => self.scheduler.attach(key, slots),
            SyncCommand::Commit(commit) => self.scheduler.commit(commit),
            SyncCommand::RequestFull { session, location } => {
                self.scheduler.request_full(session, location)
            }
            SyncCommand::SetCursor {
                session,
                location,
                cursor,
            } => self.scheduler.set_cursor(session, location, cursor),
            SyncCommand::CloseView { session, location } => {
                self.scheduler.close_view(session, location)
            }
            SyncCommand::Push { session, message } => {
                for sync in self.scheduler.flush_session(session) {
                    self.deliver(session, ServerMessage::Sync(sync));
                }
                self.deliver(session, message);
            }
            SyncCommand::ForgetSession(session) => {
                self.scheduler.forget_session(session);
                self.sinks.remove(&session);
            }
            SyncCommand::DetachContainer(key) => self.scheduler.detach_container(key),
            SyncCommand::Flush(reply) => {
                self.flush();
                let _ = reply.send(());
            }
        }
    }

    fn flush(&mut self) {
        if !self.scheduler.has_pending() {
            return;
        }
        for (session, message) in self.scheduler.flush() {
            self.deliver(session, ServerMessage::Sync(message));
        }
    }

    fn deliver(&self, session: SessionId, message: ServerMessage) {
        match self.sinks.get(&session) {
            Some(sink) => {
                trace!(%session, ?message, "sync sent");
                sink.send(message);
            }
            None => debug!(%session, "no sink registered, message dropped"),
        }
    }
}
