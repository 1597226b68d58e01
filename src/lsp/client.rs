/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use lsp_types::{Position, Range};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::binding::{Language, LanguageBinding};
use super::connection::Connection;
use super::documents::path_to_uri;
use super::events::ConnectionEvent;
use super::process::{ProcessOutput, ServerProcess};
use super::state::ConnectionState;
use crate::config::Timeouts;
use crate::error::ClientError;

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

enum Command {
    Start {
        workspace: PathBuf,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Invoke(Job),
}

/// Handle to one language server connection.
///
/// Cloning is cheap; all clones drive the same connection. The server is
/// stopped when the last handle is dropped. Results of requests arrive as
/// [`ConnectionEvent`]s on the channel given to [`LspClient::new`], never as
/// return values.
#[derive(Debug, Clone)]
pub struct LspClient {
    language: Language,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start { .. } => "Start",
            Self::Stop { .. } => "Stop",
            Self::Restart { .. } => "Restart",
            Self::Invoke(_) => "Invoke",
        };
        f.write_str(name)
    }
}

impl LspClient {
    /// Creates a disconnected client and its driver task.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(
        binding: LanguageBinding,
        timeouts: Timeouts,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let language = binding.language();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            conn: Connection::new(binding, events),
            timeouts,
            process: None,
            init_deadline: None,
            keep_alive: None,
            state: state_tx,
        };
        tokio::spawn(driver.run(inbox));

        Self {
            language,
            commands,
            state,
        }
    }

    /// Creates a client together with the receiving end of its events.
    #[must_use]
    pub fn with_events(
        binding: LanguageBinding,
        timeouts: Timeouts,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(binding, timeouts, tx), rx)
    }

    /// Language served.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// Last published lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A receiver that observes state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Spawns the server and sends `initialize`.
    ///
    /// Returns once the handshake is in flight. Use
    /// [`Self::wait_until_connected`] to wait for its completion.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyStarted`] unless disconnected, a
    /// configuration error, or [`ClientError::Spawn`].
    pub async fn start(&self, workspace: &Path) -> Result<(), ClientError> {
        let workspace = std::path::absolute(workspace).unwrap_or_else(|_| workspace.to_path_buf());
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { workspace, reply })?;
        rx.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Shuts the server down gracefully and returns to `Disconnected`.
    ///
    /// Stopping a disconnected client does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| ClientError::ClientClosed)
    }

    /// Stops, then starts again in the previous workspace.
    ///
    /// # Errors
    ///
    /// As for [`Self::start`].
    pub async fn restart(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Restart { reply })?;
        rx.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Waits until the handshake completes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if the connection settles in
    /// another state, or [`ClientError::ConnectTimeout`] after `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|s| !matches!(s, ConnectionState::Starting | ConnectionState::Initializing)),
        )
        .await;

        match settled {
            Ok(Ok(settled)) => {
                let settled = *settled;
                if settled == ConnectionState::Connected {
                    Ok(())
                } else {
                    Err(ClientError::NotConnected {
                        language: self.language,
                        state: settled,
                    })
                }
            }
            Ok(Err(_)) => Err(ClientError::ClientClosed),
            Err(_) => Err(ClientError::ConnectTimeout {
                language: self.language,
                timeout,
                state: self.state(),
            }),
        }
    }

    /// Runs `f` against the connection inside the driver task.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn invoke<F, R>(&self, f: F) -> Result<R, ClientError>
    where
        F: FnOnce(&mut Connection) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Invoke(Box::new(move |conn| {
            let _ = tx.send(f(conn));
        })))?;
        rx.await.map_err(|_| ClientError::ClientClosed)
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ClientClosed)
    }

    /// Replaces the binding used by the next start.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn set_binding(&self, binding: LanguageBinding) -> Result<(), ClientError> {
        self.invoke(move |conn| conn.set_binding(binding)).await
    }

    /// Raw `capabilities` from the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn capabilities(&self) -> Result<Option<Value>, ClientError> {
        self.invoke(|conn| conn.capabilities().cloned()).await
    }

    /// URIs of open documents.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn open_documents(&self) -> Result<Vec<String>, ClientError> {
        self.invoke(|conn| conn.open_documents()).await
    }

    /// Version of an open document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn document_version(&self, uri: &str) -> Result<Option<i32>, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.document_version(&uri)).await
    }

    /// Number of outstanding requests.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientClosed`] if the driver task is gone.
    pub async fn pending_requests(&self) -> Result<usize, ClientError> {
        self.invoke(|conn| conn.pending_requests()).await
    }

    /// Reads `path` and opens it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidDocument`] if the file cannot be read,
    /// or any error of [`Connection::open_document`].
    pub async fn open_file(&self, path: &Path) -> Result<bool, ClientError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ClientError::InvalidDocument(format!("{}: {e}", path.display())))?;
        let uri = path_to_uri(path)?;
        self.open_document(&uri, &text).await
    }

    /// See [`Connection::open_document`].
    ///
    /// # Errors
    ///
    /// As for [`Connection::open_document`].
    pub async fn open_document(&self, uri: &str, text: &str) -> Result<bool, ClientError> {
        let (uri, text) = (uri.to_string(), text.to_string());
        self.invoke(move |conn| conn.open_document(&uri, &text)).await?
    }

    /// See [`Connection::update_document`].
    ///
    /// # Errors
    ///
    /// As for [`Connection::update_document`].
    pub async fn update_document(
        &self,
        uri: &str,
        text: &str,
        version: Option<i32>,
    ) -> Result<i32, ClientError> {
        let (uri, text) = (uri.to_string(), text.to_string());
        self.invoke(move |conn| conn.update_document(&uri, &text, version))
            .await?
    }

    /// See [`Connection::save_document`].
    ///
    /// # Errors
    ///
    /// As for [`Connection::save_document`].
    pub async fn save_document(&self, uri: &str, text: Option<&str>) -> Result<(), ClientError> {
        let (uri, text) = (uri.to_string(), text.map(str::to_string));
        self.invoke(move |conn| conn.save_document(&uri, text.as_deref()))
            .await?
    }

    /// See [`Connection::close_document`].
    ///
    /// # Errors
    ///
    /// As for [`Connection::close_document`].
    pub async fn close_document(&self, uri: &str) -> Result<(), ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.close_document(&uri)).await?
    }

    /// See [`Connection::send_request`].
    ///
    /// # Errors
    ///
    /// As for [`Connection::send_request`].
    pub async fn send_request(&self, method: &str, params: Value) -> Result<i64, ClientError> {
        let method = method.to_string();
        self.invoke(move |conn| conn.send_request(&method, params))
            .await?
    }

    /// See [`Connection::send_notification`].
    ///
    /// # Errors
    ///
    /// As for [`Connection::send_notification`].
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), ClientError> {
        let method = method.to_string();
        self.invoke(move |conn| conn.send_notification(&method, params))
            .await?
    }

    /// Requests completions; the result arrives as `CompletionReady`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn completion(&self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.completion(&uri, position))
            .await?
    }

    /// Requests hover text; the result arrives as `HoverReady`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn hover(&self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.hover(&uri, position)).await?
    }

    /// Requests signature help.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn signature_help(&self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.signature_help(&uri, position))
            .await?
    }

    /// Requests definition targets.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn definition(&self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.definition(&uri, position))
            .await?
    }

    /// Requests references.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn references(
        &self,
        uri: &str,
        position: Position,
        include_declaration: bool,
    ) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.references(&uri, position, include_declaration))
            .await?
    }

    /// Requests the document outline.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn document_symbols(&self, uri: &str) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.document_symbols(&uri)).await?
    }

    /// Searches workspace symbols.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn workspace_symbols(&self, query: &str) -> Result<i64, ClientError> {
        let query = query.to_string();
        self.invoke(move |conn| conn.workspace_symbols(&query))
            .await?
    }

    /// Requests code actions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn code_actions(&self, uri: &str, range: Range) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.code_actions(&uri, range))
            .await?
    }

    /// Requests formatting edits.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn formatting(
        &self,
        uri: &str,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<i64, ClientError> {
        let uri = uri.to_string();
        self.invoke(move |conn| conn.formatting(&uri, tab_size, insert_spaces))
            .await?
    }

    /// Requests a rename.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless connected.
    pub async fn rename(
        &self,
        uri: &str,
        position: Position,
        new_name: &str,
    ) -> Result<i64, ClientError> {
        let (uri, new_name) = (uri.to_string(), new_name.to_string());
        self.invoke(move |conn| conn.rename(&uri, position, &new_name))
            .await?
    }
}

enum Step {
    Command(Option<Command>),
    Output(Option<ProcessOutput>),
    InitDeadline,
    KeepAlive,
}

/// Owns the connection and the process; runs on its own task.
struct Driver {
    conn: Connection,
    timeouts: Timeouts,
    process: Option<ServerProcess>,
    init_deadline: Option<Instant>,
    keep_alive: Option<Interval>,
    state: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        loop {
            let step = tokio::select! {
                command = inbox.recv() => Step::Command(command),
                output = next_output(&mut self.process) => Step::Output(output),
                () = deadline(self.init_deadline) => Step::InitDeadline,
                () = tick(&mut self.keep_alive) => Step::KeepAlive,
            };

            match step {
                Step::Command(Some(command)) => self.handle(command).await,
                Step::Command(None) => break,
                Step::Output(output) => self.handle_output(output),
                Step::InitDeadline => {
                    self.init_deadline = None;
                    self.conn.init_timed_out(self.timeouts.init);
                }
                Step::KeepAlive => self.check_alive(),
            }
            self.settle().await;
        }

        debug!("{} client dropped, stopping server", self.conn.language());
        self.stop().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { workspace, reply } => {
                let result = self.start(&workspace);
                self.settle().await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                self.settle().await;
                let _ = reply.send(());
            }
            Command::Restart { reply } => {
                let workspace = self
                    .conn
                    .workspace()
                    .map(Path::to_path_buf)
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_default();
                self.stop().await;
                self.settle().await;
                let result = self.start(&workspace);
                self.settle().await;
                let _ = reply.send(result);
            }
            Command::Invoke(job) => job(&mut self.conn),
        }
    }

    fn start(&mut self, workspace: &Path) -> Result<(), ClientError> {
        let command = self.conn.begin_start(workspace)?;
        let server = self.conn.binding().server_display_name();

        match ServerProcess::spawn(&command, workspace, server) {
            Ok(process) => {
                self.process = Some(process);
                self.conn.spawned();
                self.init_deadline = Some(Instant::now() + self.timeouts.init);
                Ok(())
            }
            Err(e) => {
                self.conn.spawn_failed(&e);
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        self.init_deadline = None;
        self.keep_alive = None;

        let Some(mut process) = self.process.take() else {
            if self.conn.state() != ConnectionState::Disconnected {
                self.conn.finish_stop();
            }
            return;
        };

        if self.conn.begin_shutdown() {
            self.flush(&process);
            let grace = self.timeouts.shutdown_grace;
            let until = Instant::now() + grace;

            while self.conn.shutdown_pending() {
                match tokio::time::timeout_at(until, process.next_output()).await {
                    Ok(Some(ProcessOutput::Stdout(chunk))) => {
                        self.conn.receive(&chunk);
                        self.flush(&process);
                    }
                    Ok(Some(ProcessOutput::Stderr(line))) => self.conn.stderr_line(line),
                    Ok(Some(ProcessOutput::Closed | ProcessOutput::WriteFailed(_)) | None) => {
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "{} server did not acknowledge shutdown within {grace:?}",
                            self.conn.language()
                        );
                        break;
                    }
                }
            }
        }

        self.conn.send_exit();
        self.flush(&process);
        process.terminate(self.timeouts.exit_grace).await;
        self.conn.finish_stop();
    }

    fn handle_output(&mut self, output: Option<ProcessOutput>) {
        match output {
            Some(ProcessOutput::Stdout(chunk)) => self.conn.receive(&chunk),
            Some(ProcessOutput::Stderr(line)) => self.conn.stderr_line(line),
            Some(ProcessOutput::WriteFailed(detail)) => {
                self.conn.process_lost(&format!("write failed: {detail}"));
            }
            Some(ProcessOutput::Closed) | None => {
                let detail = self
                    .process
                    .as_mut()
                    .and_then(ServerProcess::try_wait)
                    .unwrap_or_else(|| "output closed".to_string());
                self.conn.process_lost(&detail);
            }
        }
    }

    fn check_alive(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        match process.try_wait() {
            Some(detail) => {
                self.conn.process_lost(&detail);
            }
            None => trace!(
                "{} server alive (pid {:?})",
                self.conn.language(),
                process.id()
            ),
        }
    }

    fn flush(&mut self, process: &ServerProcess) {
        for frame in self.conn.take_outbound() {
            if !process.write(frame) {
                trace!("Dropping frame, server stdin closed");
            }
        }
    }

    /// Writes queued frames and aligns timers and the process with the
    /// connection state, then publishes it.
    async fn settle(&mut self) {
        let frames = self.conn.take_outbound();
        if let Some(process) = &self.process {
            for frame in frames {
                if !process.write(frame) {
                    trace!("Dropping frame, server stdin closed");
                }
            }
        }

        match self.conn.state() {
            ConnectionState::Connected => {
                self.init_deadline = None;
                if self.keep_alive.is_none() {
                    let period = self.timeouts.keep_alive;
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keep_alive = Some(interval);
                }
            }
            ConnectionState::Starting | ConnectionState::Initializing => {
                self.keep_alive = None;
            }
            ConnectionState::Error => {
                self.init_deadline = None;
                self.keep_alive = None;
                if let Some(process) = self.process.take() {
                    process.kill().await;
                }
            }
            ConnectionState::Disconnected => {
                self.init_deadline = None;
                self.keep_alive = None;
            }
        }

        let current = self.conn.state();
        self.state.send_if_modified(|published| {
            let changed = *published != current;
            *published = current;
            changed
        });
    }
}

async fn next_output(process: &mut Option<ServerProcess>) -> Option<ProcessOutput> {
    match process {
        Some(process) => process.next_output().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> Timeouts {
        Timeouts {
            init: Duration::from_millis(500),
            keep_alive: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(200),
            exit_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_operations_before_start_fail() {
        let binding = LanguageBinding::new(Language::Cpp).with_server_path("/bin/true");
        let (client, _events) = LspClient::with_events(binding, timeouts());

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.hover("file:///a.cpp", Position::new(0, 0)).await,
            Err(ClientError::NotConnected { .. })
        ));
        assert!(client.stop().await.is_ok());
        assert!(matches!(
            client.wait_until_connected(Duration::from_millis(10)).await,
            Err(ClientError::NotConnected { state: ConnectionState::Disconnected, .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error_state() -> anyhow::Result<()> {
        let binding =
            LanguageBinding::new(Language::Cpp).with_server_path("/definitely/not/clangd");
        let (client, mut events) = LspClient::with_events(binding, timeouts());
        let dir = tempfile::tempdir()?;

        let result = client.start(dir.path()).await;
        assert!(matches!(result, Err(ClientError::Spawn { .. })));
        assert_eq!(client.state(), ConnectionState::Error);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.first(),
            Some(&ConnectionEvent::StateChanged(ConnectionState::Starting))
        );
        assert!(matches!(seen.last(), Some(ConnectionEvent::ErrorOccurred(_))));

        client.stop().await?;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        Ok(())
    }

    /// Answers `initialize`, then exits while a background child keeps the
    /// pipes open, so only the liveness check can notice.
    #[cfg(unix)]
    fn exiting_server(dir: &Path) -> anyhow::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#;
        let script = format!(
            "#!/bin/sh\nsleep 2 &\nprintf 'Content-Length: {}\\r\\n\\r\\n{body}'\n",
            body.len()
        );
        let path = dir.join("exiting-server");
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_keep_alive_detects_exit_with_open_pipes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let server = exiting_server(dir.path())?;
        let binding = LanguageBinding::new(Language::Cpp).with_server_path(server);
        let timeouts = Timeouts {
            init: Duration::from_secs(5),
            ..timeouts()
        };
        let (client, mut events) = LspClient::with_events(binding, timeouts);

        client.start(dir.path()).await?;
        let mut state = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Error),
        )
        .await??;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ConnectionEvent::StateChanged(ConnectionState::Connected)));
        let message = seen.iter().find_map(|event| match event {
            ConnectionEvent::ErrorOccurred(message) => Some(message.clone()),
            _ => None,
        });
        let message = message.unwrap_or_default();
        assert!(message.contains("terminated unexpectedly"), "{message}");
        assert!(!message.contains("output closed"), "{message}");

        client.stop().await?;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        Ok(())
    }
}
