// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod anthropic;
mod error;
mod mock;
mod provider;
mod registry;
mod retry;
mod types;

pub use anthropic::AnthropicProvider;
pub use error::ModelError;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{collect_response, ModelInfo, ModelProvider, ProviderInfo, ResponseStream};
pub use registry::{default_context_window, from_config, known_driver_ids, DriverMeta};
pub use retry::{streaming_with_retry, RetryPolicy, RetrySignal};
pub use types::*;
