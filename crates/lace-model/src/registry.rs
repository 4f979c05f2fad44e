// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::bail;

use lace_config::ModelConfig;

use crate::{AnthropicProvider, MockProvider, ModelProvider};

/// Static metadata about a provider driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverMeta {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Environment variable consulted when no api key is configured.
    pub default_api_key_env: Option<&'static str>,
}

const DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        display_name: "Anthropic",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
    },
    DriverMeta {
        id: "mock",
        display_name: "Mock (offline)",
        default_api_key_env: None,
    },
];

pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}

fn driver_meta(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// Context-window size for known model names; conservative default otherwise.
pub fn default_context_window(model: &str) -> u32 {
    if model.starts_with("claude-") {
        200_000
    } else {
        128_000
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(meta) = driver_meta(&cfg.provider) {
        if let Some(env) = meta.default_api_key_env {
            return std::env::var(env).ok();
        }
    }
    None
}

/// Construct a [`ModelProvider`] from configuration.
///
/// Unknown provider ids are a configuration error listing the recognised ids.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            cfg.name.clone(),
            resolve_api_key(cfg),
            cfg.base_url.clone(),
            cfg.max_output_tokens,
            cfg.context_window,
        ))),
        "mock" => Ok(Arc::new(MockProvider)),
        other => {
            let known: Vec<&str> = known_driver_ids().collect();
            bail!(
                "unknown model provider: {other:?}; known providers: {}",
                known.join(", ")
            )
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
