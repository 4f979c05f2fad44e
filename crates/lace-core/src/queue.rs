// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessagePriority {
    #[default]
    Normal,
    High,
}

/// A user message waiting for the agent to come back to idle.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub text: String,
    pub priority: MessagePriority,
    pub metadata: Option<serde_json::Value>,
}

impl QueuedMessage {
    pub fn new(
        text: impl Into<String>,
        priority: MessagePriority,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            priority,
            metadata,
        }
    }
}

/// Observable queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_length: usize,
    pub high_priority_count: usize,
}

/// Two-level message queue.
///
/// High-priority messages are inserted at the *head* of the high sub-queue;
/// normal messages append to the tail of the normal sub-queue.  Draining is
/// FIFO over high first, then normal.
#[derive(Debug, Default)]
pub struct MessageQueue {
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue and return the new total length.
    pub fn push(&mut self, msg: QueuedMessage) -> usize {
        match msg.priority {
            MessagePriority::High => self.high.push_front(msg),
            MessagePriority::Normal => self.normal.push_back(msg),
        }
        self.len()
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_length: self.len(),
            high_priority_count: self.high.len(),
        }
    }

    /// Snapshot of the queued messages in drain order.
    pub fn contents(&self) -> Vec<QueuedMessage> {
        self.high.iter().chain(self.normal.iter()).cloned().collect()
    }

    /// Discard everything (used by `stop()`).
    pub fn clear(&mut self) {
        self.high.clear();
        self.normal.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
