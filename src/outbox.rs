//! Durable action queue.
//!
//! Mutations that could not reach the backend are appended here and replayed
//! oldest-first by the sync orchestrator. Every append is committed to SQLite
//! before it is acknowledged, so a crash right after `enqueue` returns cannot
//! lose the action.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{Mutation, TripDraft, TripId, TripPatch, UnixTimeMs};

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
const TRIPS_PATH: &str = "/trips";
const MAX_ERROR_LENGTH: usize = 512;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("entry not found: {0}")]
    NotFound(ActionId),

    #[error("corrupted entry: {id}, reason: {reason}")]
    CorruptedEntry { id: ActionId, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OutboxError {
    /// The file exists but is not a usable queue database. Lock contention
    /// and permission problems are not corruption.
    pub fn is_corrupt_file(&self) -> bool {
        match self {
            OutboxError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
            ),
            _ => false,
        }
    }
}

/// Queue-local sequence number; strictly increasing in enqueue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub i64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Create => "CREATE",
            ActionKind::Update => "UPDATE",
            ActionKind::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(ActionKind::Create),
            "UPDATE" => Some(ActionKind::Update),
            "DELETE" => Some(ActionKind::Delete),
            _ => None,
        }
    }

    pub fn method(self) -> HttpMethod {
        match self {
            ActionKind::Create => HttpMethod::Post,
            ActionKind::Update => HttpMethod::Put,
            ActionKind::Delete => HttpMethod::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

/// An action about to be enqueued; id and timestamp are assigned by the queue.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAction {
    pub kind: ActionKind,
    pub resource_path: String,
    pub payload: Option<Value>,
    /// Placeholder id handed to the caller for an offline create.
    pub local_id: Option<TripId>,
}

impl NewAction {
    pub fn from_mutation(
        mutation: &Mutation,
        local_id: Option<TripId>,
    ) -> Result<Self, OutboxError> {
        let action = match mutation {
            Mutation::Create(draft) => Self {
                kind: ActionKind::Create,
                resource_path: TRIPS_PATH.to_string(),
                payload: Some(to_payload(draft)?),
                local_id,
            },
            Mutation::Update { id, patch } => Self {
                kind: ActionKind::Update,
                resource_path: trip_path(id),
                payload: Some(to_payload(patch)?),
                local_id: None,
            },
            Mutation::Delete { id } => Self {
                kind: ActionKind::Delete,
                resource_path: trip_path(id),
                payload: None,
                local_id: None,
            },
        };
        Ok(action)
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, OutboxError> {
    serde_json::to_value(value).map_err(|e| OutboxError::Serialization(e.to_string()))
}

/// A pending mutation intent.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub resource_path: String,
    pub method: HttpMethod,
    pub payload: Option<Value>,
    pub created_at: UnixTimeMs,
    pub attempts: u32,
    pub local_id: Option<TripId>,
    pub last_error: Option<String>,
}

impl QueuedAction {
    /// Trip id carried in the resource path (`/trips/{id}`).
    pub fn target(&self) -> Option<TripId> {
        self.resource_path
            .strip_prefix(TRIPS_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|id| !id.is_empty())
            .map(TripId::new)
    }

    /// Decode back into the mutation to replay.
    pub fn to_mutation(&self) -> Result<Mutation, OutboxError> {
        let corrupted = |reason: &str| OutboxError::CorruptedEntry {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.kind.method() != self.method {
            return Err(corrupted("method does not match kind"));
        }

        match self.kind {
            ActionKind::Create => {
                if self.resource_path != TRIPS_PATH {
                    return Err(corrupted("create must target /trips"));
                }
                let payload = self.payload.clone().ok_or_else(|| corrupted("missing payload"))?;
                let draft: TripDraft =
                    serde_json::from_value(payload).map_err(|e| corrupted(&e.to_string()))?;
                Ok(Mutation::Create(draft))
            }
            ActionKind::Update => {
                let id = self.target().ok_or_else(|| corrupted("missing trip id"))?;
                let payload = self.payload.clone().ok_or_else(|| corrupted("missing payload"))?;
                let patch: TripPatch =
                    serde_json::from_value(payload).map_err(|e| corrupted(&e.to_string()))?;
                Ok(Mutation::Update { id, patch })
            }
            ActionKind::Delete => {
                let id = self.target().ok_or_else(|| corrupted("missing trip id"))?;
                Ok(Mutation::Delete { id })
            }
        }
    }
}

/// A row that could not be decoded and was moved out of the replay path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuarantinedAction {
    pub id: ActionId,
    pub reason: String,
    pub quarantined_at: UnixTimeMs,
}

pub fn trip_path(id: &TripId) -> String {
    format!("{}/{}", TRIPS_PATH, id.as_str())
}

struct RawRow {
    id: i64,
    kind: String,
    resource_path: String,
    method: String,
    payload: Option<String>,
    created_at: i64,
    attempts: i64,
    local_id: Option<String>,
    last_error: Option<String>,
}

impl RawRow {
    fn decode(self) -> Result<QueuedAction, OutboxError> {
        let id = ActionId(self.id);
        let corrupted = |reason: String| OutboxError::CorruptedEntry { id, reason };

        let kind = ActionKind::parse(&self.kind)
            .ok_or_else(|| corrupted(format!("unknown kind '{}'", self.kind)))?;
        let method = HttpMethod::parse(&self.method)
            .ok_or_else(|| corrupted(format!("unknown method '{}'", self.method)))?;
        let payload = match self.payload {
            Some(text) => Some(
                serde_json::from_str::<Value>(&text)
                    .map_err(|e| corrupted(format!("payload: {e}")))?,
            ),
            None => None,
        };

        let action = QueuedAction {
            id,
            kind,
            resource_path: self.resource_path,
            method,
            payload,
            created_at: UnixTimeMs(self.created_at.max(0) as u64),
            attempts: self.attempts.clamp(0, i64::from(u32::MAX)) as u32,
            local_id: self.local_id.map(TripId::new),
            last_error: self.last_error,
        };
        // Validates kind/method/path/payload coherence up front so replay never meets it.
        action.to_mutation()?;
        Ok(action)
    }
}

const SELECT_COLUMNS: &str =
    "id, kind, resource_path, method, payload, created_at, attempts, local_id, last_error";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        resource_path: row.get(2)?,
        method: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
        attempts: row.get(6)?,
        local_id: row.get(7)?,
        last_error: row.get(8)?,
    })
}

/// SQLite-backed FIFO of [`QueuedAction`]s.
pub struct ActionQueue {
    conn: Connection,
    path: Option<PathBuf>,
    max_entries: usize,
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("path", &self.path)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl ActionQueue {
    /// Open or create the queue at `path`. A file that is not a readable queue
    /// database is moved aside and replaced by an empty queue.
    pub fn open(path: impl AsRef<Path>, max_entries: usize) -> Result<Self, OutboxError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Self::open_at(&path, max_entries) {
            Ok(queue) => Ok(queue),
            Err(e) if e.is_corrupt_file() => {
                let aside = path.with_extension(format!("corrupt-{}", UnixTimeMs::now().0));
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Outbox database unreadable, discarding queued actions"
                );
                std::fs::rename(&path, &aside)?;
                Self::open_at(&path, max_entries)
            }
            Err(e) => Err(e),
        }
    }

    pub fn open_in_memory(max_entries: usize) -> Result<Self, OutboxError> {
        let conn = Connection::open_in_memory()?;
        let mut queue = Self {
            conn,
            path: None,
            max_entries,
        };
        queue.init_schema()?;
        Ok(queue)
    }

    fn open_at(path: &Path, max_entries: usize) -> Result<Self, OutboxError> {
        let conn = Connection::open(path)?;
        let mut queue = Self {
            conn,
            path: Some(path.to_path_buf()),
            max_entries,
        };
        queue.init_schema()?;
        let pending = queue.len()?;
        if pending > 0 {
            info!(pending, path = %path.display(), "Outbox has actions from a previous run");
        }
        Ok(queue)
    }

    fn init_schema(&mut self) -> Result<(), OutboxError> {
        let mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Outbox journal mode");

        self.conn.execute_batch(
            "PRAGMA synchronous = FULL;

             CREATE TABLE IF NOT EXISTS actions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 kind TEXT NOT NULL,
                 resource_path TEXT NOT NULL,
                 method TEXT NOT NULL,
                 payload TEXT,
                 created_at INTEGER NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 local_id TEXT,
                 last_error TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_actions_order ON actions(created_at ASC, id ASC);

             CREATE TABLE IF NOT EXISTS id_map (
                 local_id TEXT PRIMARY KEY,
                 server_id TEXT NOT NULL,
                 resolved_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS quarantined_actions (
                 id INTEGER PRIMARY KEY,
                 kind TEXT,
                 resource_path TEXT,
                 method TEXT,
                 payload TEXT,
                 reason TEXT NOT NULL,
                 quarantined_at INTEGER NOT NULL
             );",
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an action. Returns only after the row is committed.
    #[instrument(skip(self, action), fields(kind = action.kind.as_str(), path = %action.resource_path))]
    pub fn enqueue(&mut self, action: NewAction) -> Result<QueuedAction, OutboxError> {
        let count = self.len()?;
        if count >= self.max_entries {
            warn!(count, max = self.max_entries, "Outbox full, rejecting action");
            return Err(OutboxError::Full(self.max_entries));
        }

        let payload = match &action.payload {
            Some(v) => Some(
                serde_json::to_string(v).map_err(|e| OutboxError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        // createdAt never goes backwards, so FIFO by createdAt equals enqueue order
        // even if the wall clock is adjusted.
        let newest: Option<i64> = self
            .conn
            .query_row("SELECT MAX(created_at) FROM actions", [], |row| row.get(0))?;
        let now = UnixTimeMs::now().0 as i64;
        let created_at = newest.map_or(now, |n| n.max(now));

        let method = action.kind.method();
        self.conn.execute(
            "INSERT INTO actions (kind, resource_path, method, payload, created_at, attempts, local_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                action.kind.as_str(),
                action.resource_path,
                method.as_str(),
                payload,
                created_at,
                action.local_id.as_ref().map(TripId::as_str),
            ],
        )?;
        let id = ActionId(self.conn.last_insert_rowid());

        info!(action_id = %id, pending = count + 1, "Action queued");

        Ok(QueuedAction {
            id,
            kind: action.kind,
            resource_path: action.resource_path,
            method,
            payload: action.payload,
            created_at: UnixTimeMs(created_at as u64),
            attempts: 0,
            local_id: action.local_id,
            last_error: None,
        })
    }

    /// Oldest decodable action. Undecodable rows met on the way are quarantined.
    pub fn peek_oldest(&mut self) -> Result<Option<QueuedAction>, OutboxError> {
        loop {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM actions ORDER BY created_at ASC, id ASC LIMIT 1"
            );
            let raw = self.conn.query_row(&sql, [], read_row).optional()?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            let id = ActionId(raw.id);
            match raw.decode() {
                Ok(action) => return Ok(Some(action)),
                Err(e) => self.quarantine(id, &e.to_string())?,
            }
        }
    }

    /// Remove an action after its remote call was confirmed.
    pub fn remove_by_id(&mut self, id: ActionId) -> Result<bool, OutboxError> {
        let removed = self
            .conn
            .execute("DELETE FROM actions WHERE id = ?1", params![id.0])?;
        if removed > 0 {
            debug!(action_id = %id, "Action removed");
        }
        Ok(removed > 0)
    }

    /// All actions in replay order.
    pub fn list(&mut self) -> Result<Vec<QueuedAction>, OutboxError> {
        let rows: Vec<RawRow> = {
            let sql =
                format!("SELECT {SELECT_COLUMNS} FROM actions ORDER BY created_at ASC, id ASC");
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([], read_row)?;
            rows.collect::<Result<_, _>>()?
        };

        let mut actions = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = ActionId(raw.id);
            match raw.decode() {
                Ok(action) => actions.push(action),
                Err(e) => self.quarantine(id, &e.to_string())?,
            }
        }
        Ok(actions)
    }

    pub fn len(&self) -> Result<usize, OutboxError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM actions", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len()? == 0)
    }

    /// Bump `attempts` after a failed replay and keep the failure message.
    pub fn record_failure(&mut self, id: ActionId, error: &str) -> Result<u32, OutboxError> {
        let mut message = error.to_string();
        truncate_utf8_safe(&mut message, MAX_ERROR_LENGTH);

        let updated = self.conn.execute(
            "UPDATE actions SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            params![message, id.0],
        )?;
        if updated == 0 {
            return Err(OutboxError::NotFound(id));
        }
        let attempts: i64 =
            self.conn
                .query_row("SELECT attempts FROM actions WHERE id = ?1", params![id.0], |row| {
                    row.get(0)
                })?;
        Ok(attempts.max(0) as u32)
    }

    /// Complete a replayed create: in one transaction remove it, persist the
    /// `local -> server` mapping and retarget every queued action that still
    /// references the local id. Returns how many actions were rewritten.
    #[instrument(skip(self), fields(action_id = %completed, local = %local_id, server = %server_id))]
    pub fn complete_create(
        &mut self,
        completed: ActionId,
        local_id: &TripId,
        server_id: &TripId,
    ) -> Result<usize, OutboxError> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM actions WHERE id = ?1", params![completed.0])?;
        tx.execute(
            "INSERT INTO id_map (local_id, server_id, resolved_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_id) DO UPDATE SET server_id = excluded.server_id,
             resolved_at = excluded.resolved_at",
            params![
                local_id.as_str(),
                server_id.as_str(),
                UnixTimeMs::now().0 as i64
            ],
        )?;
        let rewritten = tx.execute(
            "UPDATE actions SET resource_path = ?1 WHERE resource_path = ?2",
            params![trip_path(server_id), trip_path(local_id)],
        )?;

        tx.commit()?;

        if rewritten > 0 {
            info!(rewritten, "Retargeted queued actions to server id");
        }
        Ok(rewritten)
    }

    /// Server id a local id resolved to, once its create replayed.
    pub fn resolved_id(&self, local_id: &TripId) -> Result<Option<TripId>, OutboxError> {
        let server: Option<String> = self
            .conn
            .query_row(
                "SELECT server_id FROM id_map WHERE local_id = ?1",
                params![local_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(server.map(TripId::new))
    }

    /// Whether a create for `local_id` is still waiting in the queue.
    pub fn has_pending_create(&self, local_id: &TripId) -> Result<bool, OutboxError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM actions WHERE kind = 'CREATE' AND local_id = ?1",
            params![local_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn quarantined(&self) -> Result<Vec<QuarantinedAction>, OutboxError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, reason, quarantined_at FROM quarantined_actions ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let reason: String = row.get(1)?;
            let at: i64 = row.get(2)?;
            Ok(QuarantinedAction {
                id: ActionId(id),
                reason,
                quarantined_at: UnixTimeMs(at.max(0) as u64),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn quarantine(&mut self, id: ActionId, reason: &str) -> Result<(), OutboxError> {
        warn!(action_id = %id, reason, "Quarantining corrupted action");

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO quarantined_actions
                 (id, kind, resource_path, method, payload, reason, quarantined_at)
             SELECT id, kind, resource_path, method, payload, ?2, ?3 FROM actions WHERE id = ?1",
            params![id.0, reason, UnixTimeMs::now().0 as i64],
        )?;
        tx.execute("DELETE FROM actions WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn create(title: &str) -> NewAction {
        NewAction::from_mutation(
            &Mutation::Create(TripDraft::new(title, "Italy")),
            Some(TripId::generate_local()),
        )
        .unwrap()
    }

    fn update(id: &TripId, title: &str) -> NewAction {
        NewAction::from_mutation(
            &Mutation::Update {
                id: id.clone(),
                patch: TripPatch::title(title),
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn enqueue_assigns_increasing_ids_and_fifo_order() {
        let mut queue = ActionQueue::open_in_memory(DEFAULT_MAX_ENTRIES).unwrap();
        let a = queue.enqueue(create("Rome")).unwrap();
        let b = queue.enqueue(create("Paris")).unwrap();
        let c = queue.enqueue(create("Oslo")).unwrap();

        assert!(a.id < b.id && b.id < c.id);
        assert!(a.created_at <= b.created_at && b.created_at <= c.created_at);

        let listed: Vec<_> = queue.list().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(listed, vec![a.id, b.id, c.id]);
        assert_eq!(queue.peek_oldest().unwrap().unwrap().id, a.id);
    }

    #[test]
    fn kind_fixes_method_and_path() {
        let id = TripId::new("9");
        let action = NewAction::from_mutation(&Mutation::Delete { id: id.clone() }, None).unwrap();
        assert_eq!(action.kind, ActionKind::Delete);
        assert_eq!(action.kind.method(), HttpMethod::Delete);
        assert_eq!(action.resource_path, "/trips/9");
        assert!(action.payload.is_none());

        let create = create("Rome");
        assert_eq!(create.resource_path, "/trips");
        assert_eq!(create.kind.method(), HttpMethod::Post);
    }

    #[test]
    fn remove_by_id_only_removes_that_action() {
        let mut queue = ActionQueue::open_in_memory(DEFAULT_MAX_ENTRIES).unwrap();
        let a = queue.enqueue(create("Rome")).unwrap();
        let b = queue.enqueue(create("Paris")).unwrap();

        assert!(queue.remove_by_id(a.id).unwrap());
        assert!(!queue.remove_by_id(a.id).unwrap());
        assert_eq!(queue.peek_oldest().unwrap().unwrap().id, b.id);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn queued_actions_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.db");

        let ids = {
            let mut queue = ActionQueue::open(&path, DEFAULT_MAX_ENTRIES).unwrap();
            let a = queue.enqueue(create("Rome")).unwrap();
            let b = queue.enqueue(update(&TripId::new("4"), "Rome Trip")).unwrap();
            vec![a.id, b.id]
        };

        let mut reopened = ActionQueue::open(&path, DEFAULT_MAX_ENTRIES).unwrap();
        let listed = reopened.list().unwrap();
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), ids);
        assert_eq!(listed[1].payload, Some(json!({ "title": "Rome Trip" })));
        assert_eq!(listed[1].target(), Some(TripId::new("4")));
    }

    #[test]
    fn full_queue_rejects_without_dropping() {
        let mut queue = ActionQueue::open_in_memory(2).unwrap();
        queue.enqueue(create("a")).unwrap();
        queue.enqueue(create("b")).unwrap();

        let result = queue.enqueue(create("c"));
        assert!(matches!(result, Err(OutboxError::Full(2))));
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn record_failure_increments_attempts() {
        let mut queue = ActionQueue::open_in_memory(DEFAULT_MAX_ENTRIES).unwrap();
        let a = queue.enqueue(create("Rome")).unwrap();

        assert_eq!(queue.record_failure(a.id, "HTTP 500").unwrap(), 1);
        assert_eq!(queue.record_failure(a.id, "HTTP 502").unwrap(), 2);

        let head = queue.peek_oldest().unwrap().unwrap();
        assert_eq!(head.attempts, 2);
        assert_eq!(head.last_error.as_deref(), Some("HTTP 502"));
        assert!(matches!(
            queue.record_failure(ActionId(999), "x"),
            Err(OutboxError::NotFound(_))
        ));
    }

    #[test]
    fn complete_create_rewrites_dependent_actions() {
        let mut queue = ActionQueue::open_in_memory(DEFAULT_MAX_ENTRIES).unwrap();
        let local = TripId::generate_local();
        let created = queue
            .enqueue(
                NewAction::from_mutation(
                    &Mutation::Create(TripDraft::new("Rome", "Italy")),
                    Some(local.clone()),
                )
                .unwrap(),
            )
            .unwrap();
        queue.enqueue(update(&local, "Rome Trip")).unwrap();
        queue
            .enqueue(NewAction::from_mutation(&Mutation::Delete { id: local.clone() }, None).unwrap())
            .unwrap();
        queue.enqueue(update(&TripId::new("other"), "x")).unwrap();

        assert!(queue.has_pending_create(&local).unwrap());
        let server = TripId::new("srv-1");
        let rewritten = queue.complete_create(created.id, &local, &server).unwrap();

        assert_eq!(rewritten, 2);
        assert!(!queue.has_pending_create(&local).unwrap());
        assert_eq!(queue.resolved_id(&local).unwrap(), Some(server.clone()));

        let targets: Vec<_> = queue
            .list()
            .unwrap()
            .iter()
            .map(|a| a.target().unwrap())
            .collect();
        assert_eq!(targets, vec![server.clone(), server, TripId::new("other")]);
    }

    #[test]
    fn corrupted_rows_are_quarantined_not_replayed() {
        let mut queue = ActionQueue::open_in_memory(DEFAULT_MAX_ENTRIES).unwrap();
        let good = queue.enqueue(create("Rome")).unwrap();
        queue
            .connection()
            .execute(
                "INSERT INTO actions (kind, resource_path, method, payload, created_at, attempts)
                 VALUES ('CREATE', '/trips', 'POST', '{not json', 0, 0)",
                [],
            )
            .unwrap();

        let head = queue.peek_oldest().unwrap().unwrap();
        assert_eq!(head.id, good.id);
        assert_eq!(queue.len().unwrap(), 1);

        let quarantined = queue.quarantined().unwrap();
        assert_eq!(quarantined.len(), 1);
        assert!(quarantined[0].reason.contains("payload"));
    }

    #[test]
    fn unreadable_database_file_degrades_to_empty_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        std::fs::write(&path, b"definitely not a sqlite database, just garbage bytes....").unwrap();

        let mut queue = ActionQueue::open(&path, DEFAULT_MAX_ENTRIES).unwrap();
        assert!(queue.list().unwrap().is_empty());
        queue.enqueue(create("Rome")).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn locked_database_is_reported_not_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        {
            let mut queue = ActionQueue::open(&path, DEFAULT_MAX_ENTRIES).unwrap();
            queue.enqueue(create("Rome")).unwrap();
        }

        let holder = Connection::open(&path).unwrap();
        holder
            .execute_batch("PRAGMA locking_mode = EXCLUSIVE; BEGIN EXCLUSIVE;")
            .unwrap();

        let err = ActionQueue::open(&path, DEFAULT_MAX_ENTRIES).unwrap_err();
        assert!(matches!(err, OutboxError::Sqlite(_)), "unexpected error {err:?}");
        assert!(!err.is_corrupt_file());
        let set_aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().contains("corrupt"));
        assert!(!set_aside);

        holder.execute_batch("COMMIT;").unwrap();
        drop(holder);

        let queue = ActionQueue::open(&path, DEFAULT_MAX_ENTRIES).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn mismatched_method_is_detected() {
        let action = QueuedAction {
            id: ActionId(1),
            kind: ActionKind::Update,
            resource_path: "/trips/1".into(),
            method: HttpMethod::Post,
            payload: Some(json!({ "title": "x" })),
            created_at: UnixTimeMs(0),
            attempts: 0,
            local_id: None,
            last_error: None,
        };
        assert!(matches!(
            action.to_mutation(),
            Err(OutboxError::CorruptedEntry { .. })
        ));
    }

    #[test]
    fn utf8_truncation_respects_char_boundaries() {
        let mut s = "日本語".to_string();
        truncate_utf8_safe(&mut s, 4);
        assert_eq!(s, "日");
    }
}
