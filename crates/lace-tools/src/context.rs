// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Narrow view of the agent that tools are allowed to see.
///
/// Backed by a shared handle rather than a reference to the agent itself, so
/// there is no ownership cycle between the agent and its tool contexts.
pub trait AgentHandle: Send + Sync {
    /// Whether `path` (absolute) was observed by a read tool in this thread.
    fn has_file_been_read(&self, path: &Path) -> bool;
    /// Record that a read tool observed `path`.
    fn mark_file_read(&self, path: &Path);
}

/// Per-thread set of absolute paths observed by read tools.  Write tools
/// consult it before mutating an existing file.
#[derive(Default)]
pub struct FileReadLedger {
    read: Mutex<HashSet<PathBuf>>,
}

impl AgentHandle for FileReadLedger {
    fn has_file_been_read(&self, path: &Path) -> bool {
        self.read
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    fn mark_file_read(&self, path: &Path) {
        self.read
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf());
    }
}

/// Per-execution context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    pub working_directory: PathBuf,
    /// Scratch space a tool may write intermediate files to.
    pub tool_temp_dir: PathBuf,
    /// Fires when the turn is cancelled; well-behaved tools return an
    /// aborted result with whatever partial output they have.
    pub cancel: CancellationToken,
    pub agent: Arc<dyn AgentHandle>,
}

impl ToolContext {
    pub fn new(working_directory: PathBuf, agent: Arc<dyn AgentHandle>) -> Self {
        let tool_temp_dir = std::env::temp_dir().join("lace-tools");
        Self {
            working_directory,
            tool_temp_dir,
            cancel: CancellationToken::new(),
            agent,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve a user-supplied path against the working directory.
    ///
    /// The result is lexically normalized (`.` and `..` segments removed) so
    /// that the same file always maps to the same ledger key, whether or not
    /// it exists yet.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        let absolute = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_directory.join(p)
        };
        normalize(&absolute)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
