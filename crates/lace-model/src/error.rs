// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Error kinds surfaced by model providers.
///
/// The retry layer keys off [`ModelError::is_retryable`]: transient network
/// failures and 5xx/429/408 responses are retried with backoff; client
/// errors, auth failures, and aborts are not.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("provider not configured: {0}")]
    Config(String),
    #[error("malformed provider response: {0}")]
    Protocol(String),
    #[error("request aborted")]
    Aborted,
}

impl ModelError {
    /// Classify an HTTP status into the matching error kind.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Auth(message.into()),
            _ => Self::Http {
                status,
                message: message.into(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            Self::Auth(_) | Self::Config(_) | Self::Protocol(_) | Self::Aborted => false,
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), e.to_string());
        }
        Self::Network(e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
