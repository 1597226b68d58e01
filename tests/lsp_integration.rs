// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! End-to-end tests of the client engine against the `mockls` server.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use lsp_types::Position;
use tokio::sync::mpsc;

use grove_lsp::ClientError;
use grove_lsp::config::{Config, ServerConfig, Timeouts};
use grove_lsp::lsp::documents::path_to_uri;
use grove_lsp::lsp::{
    ClientEvent, ClientManager, ConnectionEvent, ConnectionState, Language, LanguageBinding,
    LogLevel, LspClient,
};

const MOCKLS: &str = env!("CARGO_BIN_EXE_mockls");
const WAIT: Duration = Duration::from_secs(10);
const SOURCE: &str = "class Widget {};\nint compute(int x) {\n  return x;\n}\nint main() { return compute(1); }\n";

fn timeouts() -> Timeouts {
    Timeouts {
        init: Duration::from_secs(5),
        keep_alive: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(1),
        exit_grace: Duration::from_secs(1),
    }
}

fn mock_binding(flags: &[&str]) -> LanguageBinding {
    LanguageBinding::new(Language::Cpp)
        .with_server_path(MOCKLS)
        .with_extra_args(flags.iter().map(ToString::to_string).collect())
}

fn mock_client(
    flags: &[&str],
    timeouts: Timeouts,
) -> (LspClient, mpsc::UnboundedReceiver<ConnectionEvent>) {
    LspClient::with_events(mock_binding(flags), timeouts)
}

/// Writes `main.cpp` into `dir` and returns its URI.
fn source_file(dir: &Path) -> Result<String> {
    let path = dir.join("main.cpp");
    std::fs::write(&path, SOURCE)?;
    Ok(path_to_uri(&path)?)
}

async fn next_matching(
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    wanted: impl Fn(&ConnectionEvent) -> bool,
) -> Result<ConnectionEvent> {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return Ok(event);
            }
        }
        Err(anyhow!("event stream closed"))
    })
    .await
    .context("timed out waiting for event")?
}

async fn wait_for_state(client: &LspClient, state: ConnectionState) -> Result<()> {
    let mut states = client.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .context("timed out waiting for state")??;
    Ok(())
}

async fn diagnostics_message(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Result<String> {
    let event = next_matching(events, |e| matches!(e, ConnectionEvent::DiagnosticsUpdated { .. })).await?;
    let ConnectionEvent::DiagnosticsUpdated { diagnostics, .. } = event else {
        return Err(anyhow!("unexpected event"));
    };
    diagnostics
        .first()
        .map(|d| d.message.clone())
        .ok_or_else(|| anyhow!("no diagnostics"))
}

#[tokio::test]
async fn test_handshake_documents_and_stop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(&[], timeouts());

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    assert!(client.is_connected());

    let capabilities = client.capabilities().await?.context("no capabilities")?;
    assert_eq!(capabilities["hoverProvider"], true);

    assert!(client.open_document(&uri, SOURCE).await?);
    assert!(!client.open_document(&uri, SOURCE).await?);
    assert_eq!(diagnostics_message(&mut events).await?, "mockls: version 1");

    assert_eq!(client.update_document(&uri, "int y;", None).await?, 2);
    assert_eq!(diagnostics_message(&mut events).await?, "mockls: version 2");

    assert_eq!(client.update_document(&uri, "int z;", Some(7)).await?, 7);
    assert_eq!(diagnostics_message(&mut events).await?, "mockls: version 7");
    assert_eq!(client.document_version(&uri).await?, Some(7));

    client.close_document(&uri).await?;
    assert!(client.open_documents().await?.is_empty());

    client.stop().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_hover_and_completion_results() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(&["--no-diagnostics"], timeouts());

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    client.open_document(&uri, SOURCE).await?;

    let position = Position::new(4, 21);
    client.hover(&uri, position).await?;
    let hover = next_matching(&mut events, |e| matches!(e, ConnectionEvent::HoverReady { .. })).await?;
    let ConnectionEvent::HoverReady {
        uri: hovered,
        position: at,
        contents,
    } = hover
    else {
        return Err(anyhow!("unexpected event"));
    };
    assert_eq!(hovered, uri);
    assert_eq!(at, position);
    assert!(contents.contains("compute"));

    client.update_document(&uri, &format!("{SOURCE}co"), None).await?;
    client.completion(&uri, Position::new(5, 2)).await?;
    let completion =
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::CompletionReady { .. })).await?;
    let ConnectionEvent::CompletionReady {
        items,
        is_incomplete,
        ..
    } = completion
    else {
        return Err(anyhow!("unexpected event"));
    };
    assert!(!is_incomplete);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].label, "compute");
    assert_eq!(client.pending_requests().await?, 0);

    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_navigation_results() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(&["--no-diagnostics"], timeouts());

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    client.open_document(&uri, SOURCE).await?;

    client.definition(&uri, Position::new(4, 21)).await?;
    let event =
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::DefinitionReady { .. })).await?;
    let ConnectionEvent::DefinitionReady { locations, .. } = event else {
        return Err(anyhow!("unexpected event"));
    };
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].range.start, Position::new(1, 4));

    client.references(&uri, Position::new(1, 5), true).await?;
    let event =
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::ReferencesReady { .. })).await?;
    let ConnectionEvent::ReferencesReady { locations, .. } = event else {
        return Err(anyhow!("unexpected event"));
    };
    assert_eq!(locations.len(), 2);

    client.rename(&uri, Position::new(1, 5), "calc").await?;
    let event = next_matching(&mut events, |e| matches!(e, ConnectionEvent::RenameReady { .. })).await?;
    let ConnectionEvent::RenameReady { edit, .. } = event else {
        return Err(anyhow!("unexpected event"));
    };
    let changes = edit.and_then(|e| e.changes).context("no changes")?;
    assert_eq!(changes.values().map(Vec::len).sum::<usize>(), 2);

    let range = lsp_types::Range::new(Position::new(0, 0), Position::new(0, 5));
    client.code_actions(&uri, range).await?;
    let event =
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::CodeActionsReady { .. })).await?;
    assert!(matches!(event, ConnectionEvent::CodeActionsReady { ref actions, range: r, .. }
        if actions.len() == 1 && r == range));

    client.update_document(&uri, "int x;   \nint y;\n", None).await?;
    client.formatting(&uri, 4, true).await?;
    let event =
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::FormattingReady { .. })).await?;
    let ConnectionEvent::FormattingReady { edits, .. } = event else {
        return Err(anyhow!("unexpected event"));
    };
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].range.start, Position::new(0, 6));

    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_request_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(
        &["--no-diagnostics", "--fail-on", "textDocument/hover"],
        timeouts(),
    );

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    client.open_document(&uri, SOURCE).await?;

    let id = client.hover(&uri, Position::new(0, 6)).await?;
    let event =
        next_matching(&mut events, |e| matches!(e, ConnectionEvent::RequestFailed { .. })).await?;
    assert!(matches!(
        event,
        ConnectionEvent::RequestFailed { id: failed, code: Some(-32603), ref method, .. }
            if failed == id && method == "textDocument/hover"
    ));
    assert!(client.is_connected());

    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_initialize_timeout_enters_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let timeouts = Timeouts {
        init: Duration::from_millis(300),
        ..timeouts()
    };
    let (client, mut events) = mock_client(&["--hang-on", "initialize"], timeouts);

    client.start(dir.path()).await?;
    let result = client.wait_until_connected(WAIT).await;
    assert!(matches!(
        result,
        Err(ClientError::NotConnected {
            state: ConnectionState::Error,
            ..
        })
    ));

    let event = next_matching(&mut events, |e| matches!(e, ConnectionEvent::ErrorOccurred(_))).await?;
    assert!(matches!(event, ConnectionEvent::ErrorOccurred(ref m) if m.contains("did not finish initializing")));

    client.stop().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_server_crash_enters_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(&["--no-diagnostics", "--drop-after", "2"], timeouts());

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    client.open_document(&uri, SOURCE).await?;

    client.hover(&uri, Position::new(0, 6)).await?;
    next_matching(&mut events, |e| matches!(e, ConnectionEvent::HoverReady { .. })).await?;
    let event = next_matching(&mut events, |e| matches!(e, ConnectionEvent::ErrorOccurred(_))).await?;
    assert!(matches!(event, ConnectionEvent::ErrorOccurred(ref m) if m.contains("terminated unexpectedly")));
    wait_for_state(&client, ConnectionState::Error).await?;

    assert!(matches!(
        client.hover(&uri, Position::new(0, 6)).await,
        Err(ClientError::NotConnected { .. })
    ));
    assert_eq!(client.pending_requests().await?, 0);

    client.stop().await?;
    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    assert!(client.open_documents().await?.is_empty());
    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_exit_after_initialized_enters_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (client, mut events) = mock_client(&["--exit-after-initialized"], timeouts());

    client.start(dir.path()).await?;
    next_matching(&mut events, |e| matches!(e, ConnectionEvent::ErrorOccurred(_))).await?;
    wait_for_state(&client, ConnectionState::Error).await?;

    client.stop().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_server_requests_and_logs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(
        &[
            "--no-diagnostics",
            "--send-configuration-request",
            "--send-unknown-request",
            "--log-message",
            "indexing done",
            "--stderr-banner",
            "mockls ready",
        ],
        timeouts(),
    );

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;

    // Stderr and stdout are separate pipes, so the two logs arrive in any order.
    let mut logs = Vec::new();
    while logs.len() < 2 {
        let event = next_matching(&mut events, |e| matches!(e, ConnectionEvent::LogMessage { .. })).await?;
        if let ConnectionEvent::LogMessage { text, level } = event {
            logs.push((text, level));
        }
    }
    logs.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        logs,
        vec![
            ("indexing done".to_string(), LogLevel::Info),
            ("mockls ready".to_string(), LogLevel::Stderr),
        ]
    );

    // Still usable after answering the server's own requests.
    client.open_document(&uri, SOURCE).await?;
    client.document_symbols(&uri).await?;
    next_matching(&mut events, |e| matches!(e, ConnectionEvent::DocumentSymbolsReady { .. })).await?;
    assert!(client.is_connected());

    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_split_frames_are_reassembled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, mut events) = mock_client(&["--split-writes"], timeouts());

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    client.open_document(&uri, SOURCE).await?;
    assert_eq!(diagnostics_message(&mut events).await?, "mockls: version 1");

    client.workspace_symbols("comp").await?;
    let event = next_matching(&mut events, |e| {
        matches!(e, ConnectionEvent::WorkspaceSymbolsReady { .. })
    })
    .await?;
    assert!(matches!(event, ConnectionEvent::WorkspaceSymbolsReady { ref query, symbols: Some(_) } if query == "comp"));

    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_starts_fresh() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let uri = source_file(dir.path())?;
    let (client, _events) = mock_client(&["--no-diagnostics"], timeouts());

    client.start(dir.path()).await?;
    client.wait_until_connected(WAIT).await?;
    client.open_document(&uri, SOURCE).await?;
    assert!(matches!(
        client.start(dir.path()).await,
        Err(ClientError::AlreadyStarted { .. })
    ));

    client.restart().await?;
    client.wait_until_connected(WAIT).await?;
    assert!(client.open_documents().await?.is_empty());
    assert!(client.open_document(&uri, SOURCE).await?);

    client.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_server_enters_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let binding = LanguageBinding::new(Language::Cpp).with_server_path(dir.path().join("no-such-clangd"));
    let (client, mut events) = LspClient::with_events(binding, timeouts());

    assert!(matches!(
        client.start(dir.path()).await,
        Err(ClientError::Spawn { .. })
    ));
    next_matching(&mut events, |e| matches!(e, ConnectionEvent::ErrorOccurred(_))).await?;
    assert_eq!(client.state(), ConnectionState::Error);

    client.stop().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_manager_routes_and_tags_events() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("main.cpp");
    std::fs::write(&file, SOURCE)?;

    let mut config = Config {
        workspace: Some(dir.path().to_path_buf()),
        ..Config::default()
    };
    config.server.insert(
        "cpp".to_string(),
        ServerConfig {
            path: Some(MOCKLS.into()),
            ..ServerConfig::default()
        },
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ClientManager::new(config, tx);

    let uri = manager.open_file(&file).await?;
    assert!(manager.has_active_client(Language::Cpp).await);
    assert!(!manager.has_active_client(Language::Java).await);
    assert_eq!(manager.active_clients_count().await, 1);

    let event = tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if matches!(event.event, ConnectionEvent::DiagnosticsUpdated { .. }) {
                return Some(event);
            }
        }
        None
    })
    .await?
    .context("no diagnostics")?;
    assert_eq!(event.language, Language::Cpp);
    assert!(matches!(
        event,
        ClientEvent { event: ConnectionEvent::DiagnosticsUpdated { uri: ref published, .. }, .. }
            if *published == uri
    ));

    manager.shutdown_all().await;
    assert_eq!(manager.active_clients_count().await, 0);
    assert!(manager.languages().await.is_empty());
    Ok(())
}
