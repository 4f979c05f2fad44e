// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::event::{EventKind, EventPayload, ThreadEvent};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Open(String),
    #[error("unknown thread: {0}")]
    UnknownThread(String),
    #[error("event append failed (retrying once may succeed): {0}")]
    Append(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt event data at {thread_id}/{seq}: {reason}")]
    Corrupt {
        thread_id: String,
        seq: u64,
        reason: String,
    },
}

/// A thread row: id, optional session link, and a free-form metadata bag
/// (model identifier, provider identifier, compaction lineage).
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub id: String,
    pub session_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only event store keyed by thread, backed by sqlite.
///
/// Uniqueness of `TOOL_APPROVAL_RESPONSE` / `TOOL_RESULT` per
/// `(thread_id, call_id)` is enforced by a partial unique index; a duplicate
/// append is absorbed silently and the already-stored event is returned.
/// This is the database-layer defense against duplicate approvals racing in
/// from multiple sources.
pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    /// Open (or create) the store at `path`.  A corrupt or unreadable store
    /// is a fatal startup error.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?;
        Self::init(conn)
    }

    /// Open a fresh in-memory store.  Used by tests and `--provider mock` runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id            TEXT PRIMARY KEY,
                session_id    TEXT,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                thread_id  TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                seq        INTEGER NOT NULL,
                event_id   TEXT NOT NULL,
                kind       TEXT NOT NULL,
                call_id    TEXT,
                data_json  TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, seq)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS ux_events_once_per_call
                ON events (thread_id, kind, call_id)
                WHERE kind IN ('tool_approval_response', 'tool_result');
            "#,
        )
        .map_err(|e| StoreError::Open(format!("schema init: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a thread row.  Idempotent: creating an existing id returns the
    /// stored record unchanged.
    pub fn create_thread(
        &self,
        id: &str,
        session_id: Option<&str>,
    ) -> Result<ThreadRecord, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO threads (id, session_id, metadata_json, created_at)
             VALUES (?1, ?2, '{}', ?3)",
            params![id, session_id, Utc::now().to_rfc3339()],
        )?;
        drop(conn);
        self.thread(id)?
            .ok_or_else(|| StoreError::UnknownThread(id.to_string()))
    }

    pub fn thread(&self, id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        let conn = self.conn();
        let rec = conn
            .query_row(
                "SELECT id, session_id, metadata_json, created_at FROM threads WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, session_id, metadata_json, created_at)) = rec else {
            return Ok(None);
        };
        Ok(Some(ThreadRecord {
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            created_at: parse_timestamp(&created_at),
            id,
            session_id,
        }))
    }

    /// The most recently created thread, if any.
    pub fn latest_thread(&self) -> Result<Option<ThreadRecord>, StoreError> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM threads ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.thread(&id),
            None => Ok(None),
        }
    }

    /// Replace the metadata bag of a thread.
    pub fn set_thread_metadata(
        &self,
        id: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE threads SET metadata_json = ?2 WHERE id = ?1",
            params![id, metadata.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownThread(id.to_string()));
        }
        Ok(())
    }

    /// Delete a thread and (via the cascade) all its events.
    pub fn delete_thread(&self, id: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM threads WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Atomically append an event, assigning the next sequence number.
    ///
    /// When the payload collides with the at-most-one constraint (a second
    /// approval response or tool result for the same call), the stored event
    /// is returned instead and a warning is logged; nothing is written.
    pub fn append(
        &self,
        thread_id: &str,
        payload: &EventPayload,
    ) -> Result<ThreadEvent, StoreError> {
        let kind = payload.kind();
        let call_id = payload.call_id().map(str::to_string);
        let data_json =
            serde_json::to_string(payload).map_err(|e| StoreError::Append(e.to_string()))?;

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Append(e.to_string()))?;

        let known: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
                [thread_id],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Append(e.to_string()))?;
        if !known {
            return Err(StoreError::UnknownThread(thread_id.to_string()));
        }

        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE thread_id = ?1",
                [thread_id],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Append(e.to_string()))?;

        let event = ThreadEvent {
            event_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            seq: seq as u64,
            timestamp: Utc::now(),
            payload: payload.clone(),
        };

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO events
                     (thread_id, seq, event_id, kind, call_id, data_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    thread_id,
                    seq,
                    event.event_id,
                    kind.as_str(),
                    call_id,
                    data_json,
                    event.timestamp.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Append(e.to_string()))?;

        if inserted == 0 {
            // Unique-constraint collision: an approval response or tool
            // result already exists for this call.  Return the stored one.
            warn!(
                thread_id,
                kind = kind.as_str(),
                call_id = call_id.as_deref().unwrap_or(""),
                "duplicate event dropped by store constraint"
            );
            let existing = tx
                .query_row(
                    "SELECT thread_id, seq, event_id, data_json, created_at
                       FROM events
                      WHERE thread_id = ?1 AND kind = ?2 AND call_id = ?3",
                    params![thread_id, kind.as_str(), call_id],
                    row_to_event,
                )
                .map_err(|e| StoreError::Append(e.to_string()))?;
            tx.commit().map_err(|e| StoreError::Append(e.to_string()))?;
            return existing;
        }

        tx.commit().map_err(|e| StoreError::Append(e.to_string()))?;
        Ok(event)
    }

    /// All events of a thread in sequence order.
    pub fn events(&self, thread_id: &str) -> Result<Vec<ThreadEvent>, StoreError> {
        self.query_events(
            "SELECT thread_id, seq, event_id, data_json, created_at
               FROM events WHERE thread_id = ?1 ORDER BY seq",
            params![thread_id],
        )
    }

    /// Events with a sequence number strictly greater than `after_seq`.
    pub fn events_after(
        &self,
        thread_id: &str,
        after_seq: u64,
    ) -> Result<Vec<ThreadEvent>, StoreError> {
        self.query_events(
            "SELECT thread_id, seq, event_id, data_json, created_at
               FROM events WHERE thread_id = ?1 AND seq > ?2 ORDER BY seq",
            params![thread_id, after_seq as i64],
        )
    }

    fn query_events(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<ThreadEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }

    /// Whether an event of `kind` exists for `call_id` in the thread.
    pub fn exists_event(
        &self,
        thread_id: &str,
        kind: EventKind,
        call_id: &str,
    ) -> Result<bool, StoreError> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM events
                            WHERE thread_id = ?1 AND kind = ?2 AND call_id = ?3)",
            params![thread_id, kind.as_str(), call_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Fetch the first event of `kind` for `call_id`, if any.
    pub fn find_event(
        &self,
        thread_id: &str,
        kind: EventKind,
        call_id: &str,
    ) -> Result<Option<ThreadEvent>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT thread_id, seq, event_id, data_json, created_at
                   FROM events
                  WHERE thread_id = ?1 AND kind = ?2 AND call_id = ?3
                  ORDER BY seq LIMIT 1",
                params![thread_id, kind.as_str(), call_id],
                row_to_event,
            )
            .optional()?;
        row.transpose()
    }

    /// Flush and close the underlying connection.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.close()
            .map_err(|(_, e)| StoreError::Open(e.to_string()))
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ThreadEvent, StoreError>> {
    let thread_id: String = row.get(0)?;
    let seq: i64 = row.get(1)?;
    let event_id: String = row.get(2)?;
    let data_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let payload = match serde_json::from_str::<EventPayload>(&data_json) {
        Ok(p) => p,
        Err(e) => {
            return Ok(Err(StoreError::Corrupt {
                thread_id,
                seq: seq as u64,
                reason: e.to_string(),
            }))
        }
    };
    Ok(Ok(ThreadEvent {
        event_id,
        thread_id,
        seq: seq as u64,
        timestamp: parse_timestamp(&created_at),
        payload,
    }))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
