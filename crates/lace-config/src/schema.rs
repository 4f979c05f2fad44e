// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_provider() -> String {
    "anthropic".into()
}

fn default_model_name() -> String {
    "claude-sonnet-4-5".into()
}

fn default_max_tool_rounds() -> u32 {
    24
}

fn default_compaction_threshold() -> f32 {
    0.8
}

fn default_compaction_cooldown() -> u32 {
    1
}

fn default_compaction_keep_recent() -> usize {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "mock"
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name forwarded to the provider API
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_output_tokens: Option<u32>,
    /// Context window override.  When unset, the driver's catalog value
    /// (or a conservative default) is used to initialise the token budget.
    pub context_window: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            name: default_model_name(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_output_tokens: None,
            context_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of model round-trips within one user turn before the
    /// agent stops requesting follow-up completions.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Fraction of the context window at which compaction is triggered.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Minimum number of turns between two compactions.
    #[serde(default = "default_compaction_cooldown")]
    pub compaction_cooldown_turns: u32,
    /// Number of trailing events preserved verbatim by compaction.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Override for the built-in summarization prompt.
    pub compaction_prompt: Option<String>,
    /// Full system prompt override.  When set, replaces the rendered prompt.
    pub system_prompt: Option<String>,
    /// Text appended after the rendered system prompt.
    pub append_system_prompt: Option<String>,
    /// Keep `<think>` blocks in assistant messages sent back to the model.
    #[serde(default)]
    pub include_thinking: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            compaction_threshold: default_compaction_threshold(),
            compaction_cooldown_turns: default_compaction_cooldown(),
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_prompt: None,
            system_prompt: None,
            append_system_prompt: None,
            include_thinking: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the sqlite event store.  Defaults to
    /// `<data dir>/lace/threads.db` (e.g. `~/.local/share/lace/threads.db`).
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the effective database path.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(p) = &self.path {
            return p.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lace")
            .join("threads.db")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_anthropic() {
        let c = Config::default();
        assert_eq!(c.model.provider, "anthropic");
    }

    #[test]
    fn default_compaction_threshold_is_eighty_percent() {
        let c = AgentConfig::default();
        assert!((c.compaction_threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn default_cooldown_is_one_turn() {
        assert_eq!(AgentConfig::default().compaction_cooldown_turns, 1);
    }

    #[test]
    fn empty_yaml_deserializes_to_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.model.provider, "anthropic");
        assert_eq!(c.agent.max_tool_rounds, 24);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let c: Config = serde_yaml::from_str("model:\n  provider: mock\n").unwrap();
        assert_eq!(c.model.provider, "mock");
        assert_eq!(c.model.name, "claude-sonnet-4-5");
        assert!((c.agent.compaction_threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn store_path_override_wins() {
        let s = StoreConfig {
            path: Some(PathBuf::from("/tmp/custom.db")),
        };
        assert_eq!(s.resolved_path(), PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn store_default_path_ends_with_threads_db() {
        let s = StoreConfig::default();
        assert!(s.resolved_path().ends_with("lace/threads.db"));
    }
}
