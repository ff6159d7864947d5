//! Event Store (C1): the append-only log that is the sole source of truth
//! (spec.md §4.1). Every write goes through [`EventStore::write_event`],
//! which assigns `event_id`/`timestamp`, appends a canonical JSON line under
//! an advisory file lock, fsyncs, and only then folds the event into the
//! attached [`Projection`].
//!
//! Sharding: `message.create/edit/delete` events append to
//! `messages/<author>.jsonl`; every other event type appends to the shared
//! `events.jsonl` (spec.md §4.1, so sync can replicate per-agent message
//! history independently of daemon-wide control events).

use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::ids::new_event_id;
use crate::io::acquire_lock;
use crate::projection::Projection;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const LOCK_RETRIES: u32 = 20;

pub struct EventStore {
    sync_dir: PathBuf,
    projection: Arc<Projection>,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl EventStore {
    pub fn new(sync_dir: PathBuf, projection: Arc<Projection>) -> Self {
        EventStore {
            sync_dir,
            projection,
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.sync_dir.join("events.jsonl")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.sync_dir.join("messages")
    }

    fn message_shard_path(&self, author: &str) -> PathBuf {
        self.messages_dir().join(format!("{author}.jsonl"))
    }

    /// Routes by the event's *author*, not its literal `type` prefix:
    /// `message.create` carries the author directly, while
    /// `message.edit`/`message.delete` only carry a `message_id` and so need
    /// a projection lookup to find which shard they belong in. A lookup
    /// failure (message not yet known to this projection, e.g. a remote
    /// edit racing its own create) falls back to the shared control log
    /// rather than failing the write.
    fn target_path(&self, payload: &EventPayload) -> PathBuf {
        match payload {
            EventPayload::MessageCreate(p) => self.message_shard_path(&p.author_agent_name),
            EventPayload::MessageEdit(p) => self.shard_for_message(&p.message_id),
            EventPayload::MessageDelete(p) => self.shard_for_message(&p.message_id),
            _ => self.events_path(),
        }
    }

    fn shard_for_message(&self, message_id: &str) -> PathBuf {
        match self.projection.get_message(message_id) {
            Ok(Some(message)) => self.message_shard_path(&message.author_agent_name),
            _ => self.events_path(),
        }
    }

    fn in_process_mutex_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Builds a fully-formed `Event` from `payload`, appends it, and applies
    /// it to the projection. Projection failures are logged, not
    /// propagated: the log append is the durability boundary (spec.md §4.1,
    /// "never let a projection error roll back a logged write") and a later
    /// `rebuild_projection` call reconciles any drift.
    pub fn write_event(&self, payload: EventPayload) -> Result<Event> {
        let event = Event::new(payload, new_event_id(), now_rfc3339());
        self.append(&event)?;
        if let Err(err) = self.projection.apply(&event) {
            tracing::warn!(event_id = %event.event_id, error = %err, "projection apply failed after durable append");
        }
        Ok(event)
    }

    /// Folds an `Event` that originated on another machine into this store,
    /// preserving its original `event_id`/`timestamp` rather than minting
    /// new ones (spec.md §4.7 "merge"). Returns `false` without writing
    /// anything if the event_id is already present in the projection — the
    /// dedup check that makes re-running sync a no-op.
    pub fn ingest_remote_event(&self, event: Event) -> Result<bool> {
        if self.projection.event_applied(&event.event_id)? {
            return Ok(false);
        }
        self.append(&event)?;
        if let Err(err) = self.projection.apply(&event) {
            tracing::warn!(event_id = %event.event_id, error = %err, "projection apply failed for merged remote event");
        }
        Ok(true)
    }

    fn append(&self, event: &Event) -> Result<()> {
        let path = self.target_path(&event.payload);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let in_process = self.in_process_mutex_for(&path);
        let _guard = in_process.lock().unwrap();

        let lock_path = lock_path_for(&path);
        let _file_lock = acquire_lock(&lock_path, LOCK_RETRIES)
            .map_err(|e| crate::error::ThrumError::Io(e.to_string()))?;

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }

    /// Rebuilds the projection from scratch: reads `events.jsonl` and every
    /// `messages/*.jsonl` shard, merges them in `(timestamp, event_id)`
    /// order, clears the projection, and replays. Safe to call at any time
    /// (spec.md §9 "nuke and rebuild"); unknown event types are skipped by
    /// the projection's reducer, not here.
    pub fn rebuild_projection(&self) -> Result<usize> {
        let mut shard_paths = vec![self.events_path()];
        if self.messages_dir().is_dir() {
            for entry in std::fs::read_dir(self.messages_dir())? {
                let entry = entry?;
                if entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    shard_paths.push(entry.path());
                }
            }
        }

        let mut ordered: BinaryHeap<OrderedEvent> = BinaryHeap::new();
        for path in &shard_paths {
            if !path.is_file() {
                continue;
            }
            for event in stream_file(path)? {
                ordered.push(OrderedEvent(event?));
            }
        }

        self.projection.clear()?;
        let mut count = 0;
        while let Some(OrderedEvent(event)) = ordered.pop() {
            self.projection.apply(&event)?;
            count += 1;
        }
        Ok(count)
    }

    /// Streams every event in the shared control log, in on-disk order.
    /// Used by the sync engine's push/pull path, which works on whole
    /// shard files rather than the projection (spec.md §4.7).
    pub fn stream_events(&self) -> Result<Vec<Event>> {
        stream_file(&self.events_path())?.collect()
    }

    pub fn stream_message_shard(&self, author: &str) -> Result<Vec<Event>> {
        let path = self.message_shard_path(author);
        if !path.is_file() {
            return Ok(vec![]);
        }
        stream_file(&path)?.collect()
    }
}

fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut lock_path = data_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shard")
        .to_string();
    lock_path.set_file_name(format!("{file_name}.lock"));
    lock_path
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn stream_file(path: &Path) -> Result<impl Iterator<Item = Result<Event>>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(reader.lines().filter_map(|line| match line {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(serde_json::from_str::<Event>(&line).map_err(Into::into)),
        Err(e) => Some(Err(e.into())),
    }))
}

/// Orders events by `(timestamp, event_id)` for deterministic replay
/// (spec.md §4.1: "ties broken by `event_id`"), wrapped so `BinaryHeap`
/// (a max-heap) pops in ascending order via a reversed comparison.
struct OrderedEvent(Event);

impl PartialEq for OrderedEvent {
    fn eq(&self, other: &Self) -> bool {
        (&self.0.timestamp, &self.0.event_id) == (&other.0.timestamp, &other.0.event_id)
    }
}
impl Eq for OrderedEvent {}
impl PartialOrd for OrderedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&other.0.timestamp, &other.0.event_id).cmp(&(&self.0.timestamp, &self.0.event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentRegisterPayload, MessageCreatePayload};
    use crate::model::agent::AgentKind;
    use crate::model::message::{MessageBody, MessageFormat};
    use tempfile::TempDir;

    fn store() -> (TempDir, EventStore) {
        let tmp = TempDir::new().unwrap();
        let projection = Arc::new(Projection::open_in_memory().unwrap());
        let store = EventStore::new(tmp.path().to_path_buf(), projection);
        (tmp, store)
    }

    #[test]
    fn write_event_assigns_id_and_appends_to_events_log() {
        let (_tmp, store) = store();
        let event = store
            .write_event(EventPayload::AgentRegister(AgentRegisterPayload {
                name: "impl".into(),
                role: "implementer".into(),
                module: "core".into(),
                display: None,
                kind: AgentKind::Agent,
                worktree: "main".into(),
            }))
            .unwrap();

        assert!(event.event_id.starts_with("evt_"));
        assert!(store.events_path().is_file());
        assert!(store.projection.agent_exists("impl").unwrap());
    }

    #[test]
    fn message_create_shards_into_author_file_not_events_log() {
        let (_tmp, store) = store();
        store
            .write_event(EventPayload::MessageCreate(MessageCreatePayload {
                message_id: "msg_1".into(),
                thread_id: None,
                author_agent_name: "coord".into(),
                session_id: "ses_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "hi".into(), structured: None },
                scopes: vec![],
                refs: vec![],
            }))
            .unwrap();

        assert!(store.message_shard_path("coord").is_file());
        assert!(!store.events_path().is_file());
    }

    #[test]
    fn rebuild_projection_replays_all_shards_in_order() {
        let (_tmp, store) = store();
        store
            .write_event(EventPayload::AgentRegister(AgentRegisterPayload {
                name: "coord".into(),
                role: "coordinator".into(),
                module: "core".into(),
                display: None,
                kind: AgentKind::Agent,
                worktree: "main".into(),
            }))
            .unwrap();
        store
            .write_event(EventPayload::MessageCreate(MessageCreatePayload {
                message_id: "msg_1".into(),
                thread_id: None,
                author_agent_name: "coord".into(),
                session_id: "ses_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "hi".into(), structured: None },
                scopes: vec![],
                refs: vec![],
            }))
            .unwrap();

        // Simulate drift, then heal.
        store.projection.clear().unwrap();
        assert!(!store.projection.agent_exists("coord").unwrap());

        let replayed = store.rebuild_projection().unwrap();
        assert_eq!(replayed, 2);
        assert!(store.projection.agent_exists("coord").unwrap());
        assert!(store.projection.get_message("msg_1").unwrap().is_some());
    }

    #[test]
    fn message_edit_shards_with_its_author_not_the_shared_log() {
        let (_tmp, store) = store();
        store
            .write_event(EventPayload::MessageCreate(MessageCreatePayload {
                message_id: "msg_1".into(),
                thread_id: None,
                author_agent_name: "coord".into(),
                session_id: "ses_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "hi".into(), structured: None },
                scopes: vec![],
                refs: vec![],
            }))
            .unwrap();

        store
            .write_event(EventPayload::MessageEdit(crate::event::MessageEditPayload {
                message_id: "msg_1".into(),
                body: MessageBody { format: MessageFormat::Plain, content: "hi, edited".into(), structured: None },
                previous: crate::model::message::MessageEdit {
                    content: "hi".into(),
                    format: MessageFormat::Plain,
                    edited_at: now_rfc3339(),
                },
            }))
            .unwrap();

        assert!(store.message_shard_path("coord").is_file());
        assert!(!store.events_path().is_file());
        let shard_contents = std::fs::read_to_string(store.message_shard_path("coord")).unwrap();
        assert_eq!(shard_contents.lines().count(), 2);
    }

    #[test]
    fn rebuild_is_safe_with_no_shards_present() {
        let (_tmp, store) = store();
        let replayed = store.rebuild_projection().unwrap();
        assert_eq!(replayed, 0);
    }

    #[test]
    fn ingest_remote_event_is_idempotent() {
        let (_tmp, store) = store();
        let event = Event::new(
            EventPayload::AgentRegister(AgentRegisterPayload {
                name: "impl".into(),
                role: "implementer".into(),
                module: "core".into(),
                display: None,
                kind: AgentKind::Agent,
                worktree: "main".into(),
            }),
            crate::ids::new_event_id(),
            now_rfc3339(),
        );

        assert!(store.ingest_remote_event(event.clone()).unwrap());
        assert!(store.projection.agent_exists("impl").unwrap());
        // Re-ingesting the same remote event_id is a no-op, the property
        // sync relies on to make re-running a pass safe.
        assert!(!store.ingest_remote_event(event).unwrap());
    }
}
