//! JSONL replay driver.
//!
//! A script holds one step per line, executed in file order. After every
//! step the engine is flushed and each outbound message is written as one
//! JSON line, so a replay of the same script against the same data
//! directory produces the same output.

use anyhow::{bail, Context, Result};
use mdstash_core::{ItemId, SessionId};
use mdstash_net::{ClientMessage, ServerMessage};
use mdstash_server::{ServerError, Session, StashServer, SyncReceiver};
use mdstash_world::{Producer, ProducerAction, ProducerGrant};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// One line of a replay script.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Attach a session.
    Connect { session: SessionId },
    /// Deliver a client message from an attached session.
    Send {
        session: SessionId,
        message: ClientMessage,
    },
    /// Producer deposit. `grant` defaults to `count`.
    AddItem {
        session: SessionId,
        item_id: ItemId,
        count: u32,
        action: ProducerAction,
        #[serde(default)]
        grant: Option<u32>,
    },
    /// All-or-nothing consumption.
    RemoveItem {
        session: SessionId,
        item_id: ItemId,
        count: u32,
    },
    /// Run a maintenance pass.
    Maintain,
}

/// Parse a JSONL script. Blank lines are skipped; steps keep their line number.
pub fn parse_script(contents: &str) -> Result<Vec<(usize, ScriptStep)>> {
    let mut steps = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let step: ScriptStep = serde_json::from_str(line)
            .with_context(|| format!("invalid script step on line {line_no}"))?;
        steps.push((line_no, step));
    }
    if steps.is_empty() {
        bail!("replay script contains no steps");
    }
    Ok(steps)
}

/// Load a JSONL script from disk.
pub fn load_script(path: &Path) -> Result<Vec<(usize, ScriptStep)>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    parse_script(&contents).with_context(|| format!("failed to parse script {}", path.display()))
}

/// Producer that authorizes exactly what the script staged for the next call.
#[derive(Debug, Default)]
pub struct ScriptedProducer {
    staged: Mutex<BTreeMap<SessionId, ProducerGrant>>,
}

impl ScriptedProducer {
    fn stage(&self, session: SessionId, grant: ProducerGrant) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, grant);
    }
}

impl Producer for ScriptedProducer {
    fn authorize(&self, session: SessionId, action: &ProducerAction) -> ProducerGrant {
        let grant = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session)
            .unwrap_or_else(ProducerGrant::none);
        debug!(%session, ?action, "producer grant issued");
        grant
    }
}

/// One line of replay output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayOutput {
    /// A message the engine sent to a session.
    Message {
        session: SessionId,
        message: ServerMessage,
    },
    /// A step the engine refused.
    Rejected {
        line: usize,
        session: SessionId,
        error: String,
    },
    /// Result of a producer deposit.
    Leftover {
        session: SessionId,
        item_id: ItemId,
        leftover: u32,
    },
    /// Result of a removal.
    Removed {
        session: SessionId,
        item_id: ItemId,
        removed: bool,
    },
}

/// Counters reported at the end of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub steps: usize,
    pub messages: usize,
    pub rejected: usize,
}

struct Attached {
    session: Session,
    rx: SyncReceiver,
}

/// Drives a [`StashServer`] from script steps.
pub struct Replay<W: Write> {
    server: StashServer,
    producer: Arc<ScriptedProducer>,
    sessions: BTreeMap<SessionId, Attached>,
    out: W,
    summary: ReplaySummary,
}

impl<W: Write> Replay<W> {
    pub fn new(server: StashServer, producer: Arc<ScriptedProducer>, out: W) -> Self {
        Self {
            server,
            producer,
            sessions: BTreeMap::new(),
            out,
            summary: ReplaySummary::default(),
        }
    }

    /// Run every step, then disconnect all sessions and shut the engine down.
    pub async fn run(mut self, steps: &[(usize, ScriptStep)]) -> Result<ReplaySummary> {
        for (line, step) in steps {
            self.step(*line, step.clone()).await?;
            self.summary.steps += 1;
        }
        self.finish().await?;
        Ok(self.summary)
    }

    async fn step(&mut self, line: usize, step: ScriptStep) -> Result<()> {
        match step {
            ScriptStep::Connect { session } => match self.server.connect(session).await {
                Ok((handle, rx)) => {
                    self.sessions.insert(
                        session,
                        Attached {
                            session: handle,
                            rx,
                        },
                    );
                }
                Err(err) => self.rejected(line, session, &err)?,
            },
            ScriptStep::Send { session, message } => {
                let disconnect = matches!(message, ClientMessage::Disconnect);
                let result = match self.sessions.get_mut(&session) {
                    Some(attached) => attached.session.handle(message).await,
                    None => Err(ServerError::UnknownSession(session)),
                };
                if let Err(err) = result {
                    self.rejected(line, session, &err)?;
                }
                if disconnect {
                    self.drain().await?;
                    self.sessions.remove(&session);
                }
            }
            ScriptStep::AddItem {
                session,
                item_id,
                count,
                action,
                grant,
            } => {
                self.producer
                    .stage(session, ProducerGrant::single(item_id, grant.unwrap_or(count)));
                match self.server.add_item(session, item_id, count, action).await {
                    Ok(leftover) => self.emit(&ReplayOutput::Leftover {
                        session,
                        item_id,
                        leftover,
                    })?,
                    Err(err) => self.rejected(line, session, &err)?,
                }
            }
            ScriptStep::RemoveItem {
                session,
                item_id,
                count,
            } => match self.server.remove_item(session, item_id, count).await {
                Ok(removed) => self.emit(&ReplayOutput::Removed {
                    session,
                    item_id,
                    removed,
                })?,
                Err(err) => self.rejected(line, session, &err)?,
            },
            ScriptStep::Maintain => {
                if let Err(err) = self.server.maintain().await {
                    warn!(line, %err, "maintenance failed");
                }
            }
        }
        self.drain().await
    }

    fn rejected(&mut self, line: usize, session: SessionId, err: &ServerError) -> Result<()> {
        debug!(line, %session, %err, "step rejected");
        self.summary.rejected += 1;
        self.emit(&ReplayOutput::Rejected {
            line,
            session,
            error: err.to_string(),
        })
    }

    fn emit(&mut self, record: &ReplayOutput) -> Result<()> {
        write_record(&mut self.out, record)
    }

    /// Flush the scheduler and write everything queued for every session.
    async fn drain(&mut self) -> Result<()> {
        self.server.flush().await;
        for (id, attached) in self.sessions.iter_mut() {
            while let Ok(message) = attached.rx.try_recv() {
                write_record(
                    &mut self.out,
                    &ReplayOutput::Message {
                        session: *id,
                        message,
                    },
                )?;
                self.summary.messages += 1;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in &ids {
            if let Some(attached) = self.sessions.get_mut(id) {
                attached.session.disconnect().await;
            }
        }
        self.drain().await?;
        self.sessions.clear();
        self.server
            .shutdown()
            .await
            .context("engine shutdown failed")?;
        self.out.flush().context("failed to flush replay output")?;
        info!(
            steps = self.summary.steps,
            messages = self.summary.messages,
            rejected = self.summary.rejected,
            "replay finished"
        );
        Ok(())
    }
}

fn write_record<W: Write>(out: &mut W, record: &ReplayOutput) -> Result<()> {
    serde_json::to_writer(&mut *out, record).context("failed to encode replay output")?;
    out.write_all(b"\n").context("failed to write replay output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdstash_core::{ContainerKey, LocationId, Stack};
    use mdstash_net::ActionRequest;
    use mdstash_server::{AuditLog, ServerConfig};
    use mdstash_testkit::{fixture_catalog, MemoryStore};
    use mdstash_world::{SnapshotKey, CONTAINER_SLOT_COUNT, INVENTORY_SIZE};

    const SCRIPT: &str = r#"
{"op":"connect","session":1}
{"op":"add_item","session":1,"item_id":1,"count":10,"action":"Harvest"}
{"op":"send","session":1,"message":{"Action":{"location":"Inventory","slot":0,"kind":"Primary"}}}
{"op":"send","session":1,"message":{"Action":{"location":"Inventory","slot":5,"kind":"Primary"}}}
{"op":"send","session":1,"message":{"Open":{"key":{"x":0,"y":64,"z":0}}}}
{"op":"send","session":1,"message":{"Action":{"location":{"Container":{"x":0,"y":64,"z":0}},"slot":3,"kind":"Primary"}}}
{"op":"send","session":1,"message":{"Close":{"key":{"x":0,"y":64,"z":0}}}}
{"op":"remove_item","session":1,"item_id":1,"count":99}
"#;

    fn server(store: Arc<MemoryStore>, producer: Arc<ScriptedProducer>) -> StashServer {
        let config = ServerConfig {
            flush_interval_ms: 3_600_000,
            max_idle_containers: 0,
            ..ServerConfig::default()
        };
        StashServer::start(
            config,
            Arc::new(fixture_catalog()),
            producer,
            store,
            AuditLog::disabled(),
        )
    }

    fn outputs(bytes: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn parse_keeps_line_numbers_and_skips_blanks() {
        let steps = parse_script(SCRIPT).unwrap();
        assert_eq!(steps.len(), 8);
        assert_eq!(
            steps[0],
            (
                2,
                ScriptStep::Connect {
                    session: SessionId(1)
                }
            )
        );
        assert_eq!(
            steps[2].1,
            ScriptStep::Send {
                session: SessionId(1),
                message: ClientMessage::Action(ActionRequest::primary(LocationId::Inventory, 0)),
            }
        );
    }

    #[test]
    fn parse_rejects_empty_and_malformed_scripts() {
        let err = parse_script("\n\n").unwrap_err();
        assert!(err.to_string().contains("no steps"), "unexpected error: {err:#}");

        let err = parse_script("{\"op\":\"connect\"}\n{\"op\":\"teleport\"}").unwrap_err();
        assert!(err.to_string().contains("line 1"), "unexpected error: {err:#}");
    }

    #[test]
    fn staged_grant_is_used_once() {
        let producer = ScriptedProducer::default();
        producer.stage(SessionId(1), ProducerGrant::single(1, 5));
        let first = producer.authorize(SessionId(1), &ProducerAction::Harvest);
        let second = producer.authorize(SessionId(1), &ProducerAction::Harvest);
        assert_eq!(first.allowance(1), 5);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn replay_moves_items_and_persists_both_locations() {
        let key = ContainerKey::new(0, 64, 0);
        let store = Arc::new(MemoryStore::new());
        let mut seeded = vec![Stack::EMPTY; CONTAINER_SLOT_COUNT];
        seeded[3] = Stack::new(2, 7);
        store.insert_slots(SnapshotKey::Container(key), &seeded);

        let producer = Arc::new(ScriptedProducer::default());
        let mut out = Vec::new();
        let steps = parse_script(SCRIPT).unwrap();

        let summary = Replay::new(server(store.clone(), producer.clone()), producer, &mut out)
            .run(&steps)
            .await
            .unwrap();

        assert_eq!(summary.steps, 8);
        assert_eq!(summary.rejected, 0);
        let lines = outputs(&out);
        assert_eq!(lines.len(), summary.messages + 2);
        assert!(lines
            .iter()
            .any(|line| line["kind"] == "leftover" && line["leftover"] == 0));
        assert!(lines
            .iter()
            .any(|line| line["kind"] == "removed" && line["removed"] == false));
        assert!(lines
            .iter()
            .any(|line| line["message"]["CloseAck"].is_object()));

        let catalog = fixture_catalog();
        let inventory = store
            .get(&SnapshotKey::Inventory(SessionId(1)))
            .expect("inventory saved on disconnect")
            .restore(INVENTORY_SIZE, &catalog);
        assert_eq!(inventory.slots[5], Stack::new(1, 10));
        assert_eq!(inventory.slots[0], Stack::new(2, 7));

        let container = store
            .get(&SnapshotKey::Container(key))
            .expect("container saved at shutdown")
            .restore(CONTAINER_SLOT_COUNT, &catalog);
        assert!(container.slots.iter().all(Stack::is_empty));
    }

    #[tokio::test]
    async fn unknown_session_is_reported_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::new(ScriptedProducer::default());
        let mut out = Vec::new();
        let steps = parse_script(
            r#"{"op":"send","session":9,"message":{"Open":{"key":{"x":1,"y":2,"z":3}}}}"#,
        )
        .unwrap();

        let summary = Replay::new(server(store, producer.clone()), producer, &mut out)
            .run(&steps)
            .await
            .unwrap();

        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.messages, 0);
        let lines = outputs(&out);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["kind"], "rejected");
        assert_eq!(lines[0]["line"], 1);
    }
}
