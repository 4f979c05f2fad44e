// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "lace",
    about = "An interactive AI coding assistant",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Run a single prompt and exit (single-shot mode).
    #[arg(long, value_name = "TEXT")]
    pub prompt: Option<String>,

    /// Resume the latest conversation, or a specific one by thread id.
    /// An unknown id starts a new conversation with a warning.
    #[arg(
        long = "continue",
        value_name = "THREAD_ID",
        num_args = 0..=1,
        default_missing_value = ""
    )]
    pub continue_thread: Option<String>,

    /// Provider override, e.g. "anthropic" or "mock".
    #[arg(long, env = "LACE_PROVIDER")]
    pub provider: Option<String>,

    /// Model override, e.g. "claude-sonnet-4-5".
    #[arg(long, short = 'M', env = "LACE_MODEL")]
    pub model: Option<String>,

    /// Log verbosity.
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
