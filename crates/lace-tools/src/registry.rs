// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::context::ToolContext;
use crate::tool::{Tool, ToolAnnotations, ToolResult};

/// A tool descriptor — mirrors the model crate's schema type but keeps the
/// tools crate independent from it.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

struct Registered {
    tool: Arc<dyn Tool>,
    /// Compiled argument validator.  `None` when the tool's schema does not
    /// compile; validation is then skipped rather than blocking execution.
    validator: Option<jsonschema::Validator>,
}

/// Central registry holding all available tools.  Read-only after
/// construction; execution validates arguments first and always returns a
/// result, never panics.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let schema = tool.input_schema();
        let validator = match jsonschema::validator_for(&schema) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(tool = tool.name(), error = %e, "tool schema does not compile; skipping validation");
                None
            }
        };
        self.tools.insert(
            tool.name().to_string(),
            Registered {
                tool: Arc::new(tool),
                validator,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn annotations(&self, name: &str) -> Option<ToolAnnotations> {
        self.tools.get(name).map(|r| r.tool.annotations())
    }

    /// Descriptors for all registered tools, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|r| ToolSpec {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                input_schema: r.tool.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Validate `args` against the tool's schema.  `Err` carries the
    /// user-facing message.
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), String> {
        let Some(reg) = self.tools.get(name) else {
            return Err(format!("unknown tool: {name}"));
        };
        let Some(validator) = &reg.validator else {
            return Ok(());
        };
        let problems: Vec<String> = validator
            .iter_errors(args)
            .map(|e| {
                let path = e.instance_path().to_string();
                let field = if path.is_empty() {
                    "arguments".to_string()
                } else {
                    path.trim_start_matches('/').to_string()
                };
                format!("{field}: {e}")
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(format!("Validation failed: {}", problems.join("; ")))
        }
    }

    /// Validate and execute.  Every failure mode — unknown tool, bad
    /// arguments, timeout — comes back as an error result.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(reg) = self.tools.get(name) else {
            return ToolResult::error(format!("unknown tool: {name}"));
        };
        if let Err(msg) = self.validate_args(name, &args) {
            return ToolResult::error(msg);
        }
        match reg.tool.annotations().timeout {
            Some(limit) => match tokio::time::timeout(limit, reg.tool.execute(args, ctx)).await {
                Ok(result) => result,
                Err(_) => ToolResult::error(format!(
                    "tool '{name}' timed out after {}s",
                    limit.as_secs()
                )),
            },
            None => reg.tool.execute(args, ctx).await,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
