// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Grove command-line client.
//!
//! Starts the language server for a file's language, asks it one question,
//! prints the answer and shuts the server down again.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use lsp_types::{DiagnosticSeverity, Position};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use grove_lsp::config::Config;
use grove_lsp::lsp::{self, ClientEvent, ClientManager, ConnectionEvent, Language};

/// Command-line arguments for Grove.
#[derive(Parser, Debug)]
#[command(name = "grove")]
#[command(about = "Ask C++ and Java language servers about your code")]
#[command(version = env!("GROVE_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root (default: config value, then current directory).
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Seconds to wait for an answer.
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,
}

/// Subcommands supported by Grove.
#[derive(Subcommand, Debug)]
enum Command {
    /// Show how each language server would be launched.
    Doctor,

    /// Print hover information at a position.
    Hover {
        /// Source file.
        file: PathBuf,
        /// Line, 1-based.
        line: u32,
        /// Column, 1-based.
        column: u32,
    },

    /// Print completion candidates at a position.
    Complete {
        /// Source file.
        file: PathBuf,
        /// Line, 1-based.
        line: u32,
        /// Column, 1-based.
        column: u32,
        /// Maximum candidates to print.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the diagnostics published for a file.
    Diagnostics {
        /// Source file.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("grove_lsp=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.clone())?;
    if let Some(workspace) = &args.workspace {
        config.workspace = Some(
            workspace
                .canonicalize()
                .with_context(|| format!("Invalid workspace: {}", workspace.display()))?,
        );
    }
    let timeout = Duration::from_secs(args.timeout);

    match args.command {
        Command::Doctor => {
            run_doctor(&config);
            Ok(())
        }
        Command::Hover { file, line, column } => {
            run_hover(config, &file, position(line, column), timeout).await
        }
        Command::Complete {
            file,
            line,
            column,
            limit,
        } => run_complete(config, &file, position(line, column), limit, timeout).await,
        Command::Diagnostics { file } => run_diagnostics(config, &file, timeout).await,
    }
}

const fn position(line: u32, column: u32) -> Position {
    Position {
        line: line.saturating_sub(1),
        character: column.saturating_sub(1),
    }
}

fn run_doctor(config: &Config) {
    let workspace = config.workspace_root();
    println!("Grove {}", env!("GROVE_VERSION"));
    println!("Workspace: {}", workspace.display());

    let detected = lsp::detect_workspace_languages(std::slice::from_ref(&workspace));
    println!();

    for language in Language::ALL {
        let binding = config.binding(language);
        let present = if detected.contains(&language) {
            "files found"
        } else {
            "no files"
        };
        println!(
            "{:<5} {:<7} ({present})",
            language.id(),
            binding.server_display_name()
        );

        match binding.launch_command(&workspace) {
            Ok(command) => {
                println!("      {} {}", command.program.display(), command.args.join(" "));
            }
            Err(e) => println!("      unavailable: {e}"),
        }
    }
}

async fn run_hover(config: Config, file: &Path, position: Position, timeout: Duration) -> Result<()> {
    let (manager, mut events) = start(config);
    let result = hover(&manager, &mut events, file, position, timeout).await;
    manager.shutdown_all().await;
    result
}

async fn hover(
    manager: &ClientManager,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    file: &Path,
    position: Position,
    timeout: Duration,
) -> Result<()> {
    let uri = manager.open_file(file).await?;
    let client = manager.client_for_path(file).await?;
    let id = client.hover(&uri, position).await?;

    let event = wait_for(events, timeout, id, |e| {
        matches!(e, ConnectionEvent::HoverReady { .. })
    })
    .await?;
    if let ConnectionEvent::HoverReady { contents, .. } = event {
        if contents.is_empty() {
            println!("(no hover information)");
        } else {
            println!("{contents}");
        }
    }
    Ok(())
}

async fn run_complete(
    config: Config,
    file: &Path,
    position: Position,
    limit: usize,
    timeout: Duration,
) -> Result<()> {
    let (manager, mut events) = start(config);
    let result = complete(&manager, &mut events, file, position, limit, timeout).await;
    manager.shutdown_all().await;
    result
}

async fn complete(
    manager: &ClientManager,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    file: &Path,
    position: Position,
    limit: usize,
    timeout: Duration,
) -> Result<()> {
    let uri = manager.open_file(file).await?;
    let client = manager.client_for_path(file).await?;
    let id = client.completion(&uri, position).await?;

    let event = wait_for(events, timeout, id, |e| {
        matches!(e, ConnectionEvent::CompletionReady { .. })
    })
    .await?;
    if let ConnectionEvent::CompletionReady {
        items,
        is_incomplete,
        ..
    } = event
    {
        for item in items.iter().take(limit) {
            match &item.detail {
                Some(detail) => println!("{:<32} {detail}", item.label),
                None => println!("{}", item.label),
            }
        }
        if items.len() > limit || is_incomplete {
            println!("... ({} shown of {}+)", limit.min(items.len()), items.len());
        }
    }
    Ok(())
}

async fn run_diagnostics(config: Config, file: &Path, timeout: Duration) -> Result<()> {
    let (manager, mut events) = start(config);
    let result = diagnostics(&manager, &mut events, file, timeout).await;
    manager.shutdown_all().await;
    result
}

async fn diagnostics(
    manager: &ClientManager,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    file: &Path,
    timeout: Duration,
) -> Result<()> {
    let uri = manager.open_file(file).await?;
    let until = Instant::now() + timeout;

    loop {
        let event = tokio::time::timeout_at(until, events.recv())
            .await
            .map_err(|_| anyhow!("No diagnostics within {timeout:?}"))?
            .ok_or_else(|| anyhow!("Event stream closed"))?;

        match event.event {
            ConnectionEvent::DiagnosticsUpdated {
                uri: published,
                diagnostics,
            } if published == uri => {
                if diagnostics.is_empty() {
                    println!("{}: no problems", file.display());
                }
                for diagnostic in diagnostics {
                    println!(
                        "{}:{}:{}: {}: {}",
                        file.display(),
                        diagnostic.range.start.line + 1,
                        diagnostic.range.start.character + 1,
                        severity(diagnostic.severity),
                        diagnostic.message
                    );
                }
                return Ok(());
            }
            ConnectionEvent::ErrorOccurred(message) => bail!(message),
            other => debug!("Ignoring {other:?}"),
        }
    }
}

fn start(config: Config) -> (ClientManager, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ClientManager::new(config, tx), rx)
}

/// Waits for the first event accepted by `wanted`, failing on errors and
/// on a failure of request `id`.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    timeout: Duration,
    id: i64,
    wanted: impl Fn(&ConnectionEvent) -> bool,
) -> Result<ConnectionEvent> {
    let until = Instant::now() + timeout;
    loop {
        let ClientEvent { event, .. } = tokio::time::timeout_at(until, events.recv())
            .await
            .map_err(|_| anyhow!("No answer within {timeout:?}"))?
            .ok_or_else(|| anyhow!("Event stream closed"))?;

        if wanted(&event) {
            return Ok(event);
        }
        match event {
            ConnectionEvent::RequestFailed {
                id: failed,
                message,
                ..
            } if failed == id => bail!("Request failed: {message}"),
            ConnectionEvent::ErrorOccurred(message) => bail!(message),
            other => debug!("Ignoring {other:?}"),
        }
    }
}

fn severity(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(DiagnosticSeverity::ERROR) => "error",
        Some(DiagnosticSeverity::WARNING) => "warning",
        Some(DiagnosticSeverity::HINT) => "hint",
        _ => "info",
    }
}
