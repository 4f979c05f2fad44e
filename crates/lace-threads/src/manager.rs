// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::event::{EventKind, EventPayload, ThreadEvent};
use crate::log::{EventLog, StoreError, ThreadRecord};
use crate::thread_id::{generate_thread_id, THREAD_ID_PREFIX};

/// Result of [`ThreadManager::resume_or_create`].
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub thread_id: String,
    pub is_resumed: bool,
    /// User-visible note when a requested thread id was not found and a new
    /// thread was created instead.
    pub resume_error: Option<String>,
}

/// Creates and resumes threads, appends events through the log, and fans out
/// `thread_event_added` notifications to in-process observers.
///
/// Not concurrency-safe across processes; within a process, appends to the
/// same thread are serialized by a per-thread mutex.
pub struct ThreadManager {
    log: Arc<EventLog>,
    notify: broadcast::Sender<ThreadEvent>,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadManager {
    pub fn new(log: Arc<EventLog>) -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            log,
            notify,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Subscribe to append notifications for all threads.
    pub fn subscribe(&self) -> broadcast::Receiver<ThreadEvent> {
        self.notify.subscribe()
    }

    pub fn generate_id(&self) -> String {
        generate_thread_id(THREAD_ID_PREFIX)
    }

    /// Create a thread.  With no id, a fresh one is minted.  Idempotent on an
    /// existing id.
    pub fn create_thread(
        &self,
        id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<ThreadRecord, StoreError> {
        match id {
            Some(id) => self.log.create_thread(id, session_id),
            None => {
                let id = self.generate_id();
                self.log.create_thread(&id, session_id)
            }
        }
    }

    /// Resume the most recently created thread, or create one when the
    /// store is empty.
    pub fn resume_latest_or_create(&self) -> Result<ResumeOutcome, StoreError> {
        match self.log.latest_thread()? {
            Some(record) => Ok(ResumeOutcome {
                thread_id: record.id,
                is_resumed: true,
                resume_error: None,
            }),
            None => self.resume_or_create(None),
        }
    }

    /// Resume `id` if it exists; otherwise create a new thread.  A requested
    /// but missing id yields a `resume_error` the caller surfaces to the user.
    pub fn resume_or_create(&self, id: Option<&str>) -> Result<ResumeOutcome, StoreError> {
        if let Some(requested) = id {
            if self.log.thread(requested)?.is_some() {
                debug!(thread_id = requested, "resuming thread");
                return Ok(ResumeOutcome {
                    thread_id: requested.to_string(),
                    is_resumed: true,
                    resume_error: None,
                });
            }
            let created = self.create_thread(None, None)?;
            return Ok(ResumeOutcome {
                thread_id: created.id,
                is_resumed: false,
                resume_error: Some(format!(
                    "thread {requested} not found; starting a new conversation"
                )),
            });
        }
        let created = self.create_thread(None, None)?;
        Ok(ResumeOutcome {
            thread_id: created.id,
            is_resumed: false,
            resume_error: None,
        })
    }

    async fn append_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append an event and notify observers.  Appends to the same thread are
    /// serialized; the store's uniqueness constraint silently absorbs
    /// duplicate approval responses and tool results.
    pub async fn append(
        &self,
        thread_id: &str,
        payload: EventPayload,
    ) -> Result<ThreadEvent, StoreError> {
        let lock = self.append_lock(thread_id).await;
        let _guard = lock.lock().await;
        let event = self.log.append(thread_id, &payload)?;
        // Nobody listening is fine; observers come and go.
        let _ = self.notify.send(event.clone());
        Ok(event)
    }

    pub fn events(&self, thread_id: &str) -> Result<Vec<ThreadEvent>, StoreError> {
        self.log.events(thread_id)
    }

    pub fn events_after(
        &self,
        thread_id: &str,
        after_seq: u64,
    ) -> Result<Vec<ThreadEvent>, StoreError> {
        self.log.events_after(thread_id, after_seq)
    }

    pub fn exists_event(
        &self,
        thread_id: &str,
        kind: EventKind,
        call_id: &str,
    ) -> Result<bool, StoreError> {
        self.log.exists_event(thread_id, kind, call_id)
    }

    pub fn find_event(
        &self,
        thread_id: &str,
        kind: EventKind,
        call_id: &str,
    ) -> Result<Option<ThreadEvent>, StoreError> {
        self.log.find_event(thread_id, kind, call_id)
    }

    /// Merge `key: value` into a thread's metadata bag.
    pub fn set_metadata_key(
        &self,
        thread_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let record = self
            .log
            .thread(thread_id)?
            .ok_or_else(|| StoreError::UnknownThread(thread_id.to_string()))?;
        let mut metadata = record.metadata;
        if !metadata.is_object() {
            metadata = serde_json::json!({});
        }
        if let Some(map) = metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self.log.set_thread_metadata(thread_id, &metadata)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
