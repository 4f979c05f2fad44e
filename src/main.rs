// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt};

use cli::{Cli, LogLevel};
use lace_config::Config;
use lace_core::{Agent, AgentEvent, PromptContext, SendOptions};
use lace_threads::{ApprovalDecision, EventLog, EventPayload, ResumeOutcome, ThreadManager};
use lace_tools::{EditFileTool, ReadFileTool, ToolRegistry, WriteFileTool};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    if let Some(prompt) = &cli.prompt {
        if prompt.trim().is_empty() {
            eprintln!("prompt requires a prompt text");
            return Ok(1);
        }
    }

    init_logging(cli.log_level, cli.log_file.as_deref());

    let mut config = lace_config::load(cli.config.as_deref())?;
    if let Some(provider) = &cli.provider {
        config.model.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }

    let provider = lace_model::from_config(&config.model)?;

    let log = Arc::new(EventLog::open(&config.store.resolved_path())?);
    let threads = Arc::new(ThreadManager::new(log));

    let resume = resolve_thread(&threads, cli.continue_thread.as_deref())?;
    if let Some(note) = &resume.resume_error {
        eprintln!("warning: {note}");
    }
    if resume.is_resumed {
        println!("Resuming conversation {}", resume.thread_id);
    } else {
        println!("Starting new conversation {}", resume.thread_id);
    }

    let Some(prompt) = cli.prompt else {
        // No prompt: the session is prepared (created or resumed) and an
        // interactive front-end can attach to it.
        return Ok(0);
    };

    // Credentials are only required once a model call is imminent.
    if !provider.is_configured() {
        eprintln!(
            "provider '{}' is not configured: missing credential (set {})",
            config.model.provider,
            config
                .model
                .api_key_env
                .as_deref()
                .unwrap_or("the provider's API key environment variable"),
        );
        return Ok(1);
    }

    let agent = Arc::new(build_agent(&config, threads, resume.thread_id, provider)?);
    let printer = spawn_printer(&agent);
    // Single-shot runs are headless; there is nobody to click an approval
    // dialog, so every requested tool call is allowed once.
    let approver = spawn_auto_approver(Arc::clone(&agent));

    match agent.send_message(prompt, SendOptions::default()).await {
        Ok(()) => {
            let _ = printer.await;
            approver.abort();
            Ok(0)
        }
        Err(e) => {
            printer.abort();
            approver.abort();
            Err(e)
        }
    }
}

fn resolve_thread(
    threads: &ThreadManager,
    continue_thread: Option<&str>,
) -> anyhow::Result<ResumeOutcome> {
    let outcome = match continue_thread {
        None => threads.resume_or_create(None)?,
        Some("") => threads.resume_latest_or_create()?,
        Some(id) => threads.resume_or_create(Some(id))?,
    };
    Ok(outcome)
}

fn build_agent(
    config: &Config,
    threads: Arc<ThreadManager>,
    thread_id: String,
    provider: Arc<dyn lace_model::ModelProvider>,
) -> anyhow::Result<Agent> {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteFileTool);
    registry.register(EditFileTool);

    let working_directory = std::env::current_dir()?;
    let project_context = std::fs::read_to_string(working_directory.join(".lace/context.md")).ok();
    let prompt_ctx = PromptContext {
        working_directory,
        project_context,
        append: None,
    };

    Agent::new(
        threads,
        thread_id,
        provider,
        Arc::new(registry),
        Arc::new(config.agent.clone()),
        prompt_ctx,
        None,
    )
}

/// Stream the assistant's text to stdout until the turn completes.  Tool
/// activity goes to stderr so piped output stays clean.
fn spawn_printer(agent: &Agent) -> tokio::task::JoinHandle<()> {
    let mut rx = agent.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(AgentEvent::Token(text)) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                Ok(AgentEvent::ToolUseStart { name, .. }) => {
                    eprintln!("[tool: {name}]");
                }
                Ok(AgentEvent::RetryAttempt { attempt, delay_ms }) => {
                    eprintln!("[retrying model request: attempt {attempt}, waiting {delay_ms} ms]");
                }
                Ok(AgentEvent::Error(message)) => {
                    eprintln!("[error: {message}]");
                }
                Ok(AgentEvent::TurnCompleted { .. }) => {
                    println!();
                    return;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_auto_approver(agent: Arc<Agent>) -> tokio::task::JoinHandle<()> {
    let mut rx = agent.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(AgentEvent::ThreadEventAdded(ev)) => {
                    if let EventPayload::ToolApprovalRequest { call_id } = ev.payload {
                        if let Err(e) = agent
                            .submit_approval(&call_id, ApprovalDecision::AllowOnce)
                            .await
                        {
                            tracing::warn!(call_id, error = %e, "auto-approval failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn init_logging(level: LogLevel, log_file: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            match file {
                Ok(file) => {
                    fmt()
                        .with_env_filter(filter)
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .init();
                }
                Err(e) => {
                    eprintln!("warning: cannot open log file {}: {e}", path.display());
                    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
                }
            }
        }
        None => {
            fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
}
