// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The per-language connection state machine.
//!
//! [`Connection`] owns everything about one server session except the
//! process itself: lifecycle state, request ledger, document registry,
//! receive buffer and negotiated capabilities. It performs no I/O. Bytes read
//! from the server are pushed in with [`Connection::receive`]; frames to
//! write are drained with [`Connection::take_outbound`]; consumer-facing
//! events go to the channel supplied at construction. The async driver in
//! [`super::client`] moves bytes and timer expirations between this type and
//! a real process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use lsp_types::{
    CodeActionContext, CodeActionOrCommand, CodeActionParams, CompletionParams,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, DocumentFormattingParams, DocumentSymbolParams,
    DocumentSymbolResponse, FormattingOptions, GotoDefinitionParams, HoverParams, Location,
    PartialResultParams, Position, PublishDiagnosticsParams, Range, ReferenceContext,
    ReferenceParams, RenameParams, ServerCapabilities, SignatureHelp, SignatureHelpParams,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, TextEdit, Uri, VersionedTextDocumentIdentifier,
    WorkDoneProgressParams, WorkspaceEdit, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::binding::{Language, LanguageBinding, LaunchCommand};
use super::documents::{DocumentChange, DocumentRegistry, document_uri};
use super::events::ConnectionEvent;
use super::ledger::{PendingRequest, RequestLedger};
use super::protocol::{
    self, FrameDecoder, Message, NotificationMessage, RequestId, RequestMessage, ResponseMessage,
    error_codes,
};
use super::state::ConnectionState;
use super::types::{self, LogLevel, RequestOrigin};
use crate::error::ClientError;

/// Method names with built-in handling.
pub mod method {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification.
    pub const INITIALIZED: &str = "initialized";
    /// Graceful shutdown request.
    pub const SHUTDOWN: &str = "shutdown";
    /// Final exit notification.
    pub const EXIT: &str = "exit";
    /// Completion request.
    pub const COMPLETION: &str = "textDocument/completion";
    /// Hover request.
    pub const HOVER: &str = "textDocument/hover";
    /// Signature help request.
    pub const SIGNATURE_HELP: &str = "textDocument/signatureHelp";
    /// Go-to-definition request.
    pub const DEFINITION: &str = "textDocument/definition";
    /// Find-references request.
    pub const REFERENCES: &str = "textDocument/references";
    /// Document outline request.
    pub const DOCUMENT_SYMBOL: &str = "textDocument/documentSymbol";
    /// Workspace symbol search request.
    pub const WORKSPACE_SYMBOL: &str = "workspace/symbol";
    /// Code action request.
    pub const CODE_ACTION: &str = "textDocument/codeAction";
    /// Whole-document formatting request.
    pub const FORMATTING: &str = "textDocument/formatting";
    /// Rename request.
    pub const RENAME: &str = "textDocument/rename";
    /// Document opened.
    pub const DID_OPEN: &str = "textDocument/didOpen";
    /// Document changed.
    pub const DID_CHANGE: &str = "textDocument/didChange";
    /// Document saved.
    pub const DID_SAVE: &str = "textDocument/didSave";
    /// Document closed.
    pub const DID_CLOSE: &str = "textDocument/didClose";
    /// Diagnostics pushed by the server.
    pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
    /// Server log line.
    pub const LOG_MESSAGE: &str = "window/logMessage";
    /// Server message meant for the user.
    pub const SHOW_MESSAGE: &str = "window/showMessage";
}

/// Requests whose results are decoded into events.
const DECODED_METHODS: &[&str] = &[
    method::COMPLETION,
    method::HOVER,
    method::SIGNATURE_HELP,
    method::DEFINITION,
    method::REFERENCES,
    method::DOCUMENT_SYMBOL,
    method::WORKSPACE_SYMBOL,
    method::CODE_ACTION,
    method::FORMATTING,
    method::RENAME,
];

/// One server session for one language.
#[derive(Debug)]
pub struct Connection {
    binding: LanguageBinding,
    state: ConnectionState,
    workspace: Option<PathBuf>,
    ledger: RequestLedger,
    documents: DocumentRegistry,
    decoder: FrameDecoder,
    capabilities: Option<Value>,
    server_name: Option<String>,
    init_request: Option<i64>,
    shutdown_request: Option<i64>,
    outbound: Vec<Bytes>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    /// Creates a disconnected connection that reports to `events`.
    #[must_use]
    pub fn new(binding: LanguageBinding, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            binding,
            state: ConnectionState::Disconnected,
            workspace: None,
            ledger: RequestLedger::new(),
            documents: DocumentRegistry::new(),
            decoder: FrameDecoder::new(),
            capabilities: None,
            server_name: None,
            init_request: None,
            shutdown_request: None,
            outbound: Vec::new(),
            events,
        }
    }

    /// Language served by this connection.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.binding.language()
    }

    /// The binding used for the next start.
    #[must_use]
    pub const fn binding(&self) -> &LanguageBinding {
        &self.binding
    }

    /// Replaces the binding. Takes effect on the next start.
    pub fn set_binding(&mut self, binding: LanguageBinding) {
        self.binding = binding;
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Workspace of the current or most recent session.
    #[must_use]
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Raw `capabilities` object from the `initialize` result.
    #[must_use]
    pub const fn capabilities(&self) -> Option<&Value> {
        self.capabilities.as_ref()
    }

    /// Capabilities decoded with `lsp-types`, if they parse.
    #[must_use]
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities
            .clone()
            .and_then(|caps| serde_json::from_value(caps).ok())
    }

    /// `serverInfo.name` reported during the handshake.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.ledger.len()
    }

    /// Whether request `id` is outstanding.
    #[must_use]
    pub fn is_pending(&self, id: i64) -> bool {
        self.ledger.contains(id)
    }

    /// Version of an open document.
    #[must_use]
    pub fn document_version(&self, uri: &str) -> Option<i32> {
        document_uri(uri)
            .ok()
            .and_then(|uri| self.documents.version(&uri))
    }

    /// URIs of all open documents.
    #[must_use]
    pub fn open_documents(&self) -> Vec<String> {
        self.documents.uris()
    }

    /// Drains frames queued for the server, in send order.
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    // ---- lifecycle ----

    /// Resolves the launch command and enters `Starting`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyStarted`] unless `Disconnected`, or a
    /// configuration error when the binding cannot produce a command. In the
    /// latter case an `ErrorOccurred` event is emitted and the state stays
    /// `Disconnected`.
    pub fn begin_start(&mut self, workspace: &Path) -> Result<LaunchCommand, ClientError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ClientError::AlreadyStarted {
                language: self.language(),
                state: self.state,
            });
        }

        let command = match self.binding.launch_command(workspace) {
            Ok(command) => command,
            Err(e) => {
                error!("Cannot start {} server: {e}", self.language());
                self.emit(ConnectionEvent::ErrorOccurred(e.to_string()));
                return Err(e);
            }
        };

        self.workspace = Some(workspace.to_path_buf());
        self.decoder.clear();
        self.transition(ConnectionState::Starting);
        Ok(command)
    }

    /// Records that the process could not be spawned.
    pub fn spawn_failed(&mut self, error: &ClientError) {
        self.enter_error(error.to_string());
    }

    /// Records a running process: sends `initialize` and enters
    /// `Initializing`.
    pub fn spawned(&mut self) {
        if self.state != ConnectionState::Starting {
            warn!("Ignoring spawn notice in state {}", self.state);
            return;
        }

        let workspace = self.workspace.clone().unwrap_or_default();
        let params = self.initialize_params(&workspace);
        let id = self.ledger.register(method::INITIALIZE, RequestOrigin::None);
        self.init_request = Some(id);

        if let Err(e) = self.queue(&RequestMessage::new(id, method::INITIALIZE, params)) {
            self.enter_error(e.to_string());
            return;
        }
        self.transition(ConnectionState::Initializing);
    }

    /// Handshake deadline expired. Returns `true` if this forced `Error`.
    pub fn init_timed_out(&mut self, timeout: Duration) -> bool {
        if self.state != ConnectionState::Initializing {
            return false;
        }
        let error = ClientError::InitTimeout {
            server: self.binding.server_display_name().to_string(),
            timeout,
        };
        self.enter_error(error.to_string());
        true
    }

    /// The process died or its pipes broke. Returns `true` if this forced
    /// `Error`.
    pub fn process_lost(&mut self, detail: &str) -> bool {
        if !self.state.is_running() {
            return false;
        }
        let error = ClientError::ProcessExited {
            server: self.binding.server_display_name().to_string(),
            detail: detail.to_string(),
        };
        self.enter_error(error.to_string());
        true
    }

    /// Queues a `shutdown` request when the handshake completed. Returns
    /// `true` if the caller should wait for its response.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.state != ConnectionState::Connected || self.shutdown_request.is_some() {
            return self.shutdown_request.is_some();
        }
        let id = self.ledger.register(method::SHUTDOWN, RequestOrigin::None);
        match self.queue(&RequestMessage::new(id, method::SHUTDOWN, Value::Null)) {
            Ok(()) => {
                self.shutdown_request = Some(id);
                true
            }
            Err(e) => {
                self.ledger.resolve(id);
                warn!("Failed to queue shutdown: {e}");
                false
            }
        }
    }

    /// Whether a `shutdown` request is still unanswered.
    #[must_use]
    pub const fn shutdown_pending(&self) -> bool {
        self.shutdown_request.is_some()
    }

    /// Queues the `exit` notification if a process may be listening.
    pub fn send_exit(&mut self) {
        if !self.state.is_running() {
            return;
        }
        if let Err(e) = self.queue(&NotificationMessage::new(method::EXIT, Value::Null)) {
            warn!("Failed to queue exit: {e}");
        }
    }

    /// Completes a stop after the process is gone: clears the ledger,
    /// documents, receive buffer and capabilities, then enters
    /// `Disconnected`.
    pub fn finish_stop(&mut self) {
        let dropped = self.ledger.clear();
        if dropped > 0 {
            debug!("Abandoned {dropped} pending {} requests", self.language());
        }
        self.documents.clear();
        self.decoder.clear();
        self.outbound.clear();
        self.capabilities = None;
        self.server_name = None;
        self.init_request = None;
        self.shutdown_request = None;
        self.transition(ConnectionState::Disconnected);
    }

    // ---- inbound ----

    /// Feeds bytes read from the server's stdout.
    pub fn receive(&mut self, chunk: &[u8]) {
        for value in self.decoder.feed(chunk) {
            if !self.state.is_running() {
                trace!("Dropping message received in state {}", self.state);
                continue;
            }
            match Message::classify(value) {
                Ok(Message::Response(response)) => self.handle_response(response),
                Ok(Message::Request(request)) => self.handle_server_request(request),
                Ok(Message::Notification(notification)) => self.handle_notification(notification),
                Err(e) => warn!("Dropping {} message: {e}", self.language()),
            }
        }
    }

    /// Forwards a line the server wrote to stderr.
    pub fn stderr_line(&self, line: String) {
        debug!("{} stderr: {line}", self.language());
        self.emit(ConnectionEvent::LogMessage {
            text: line,
            level: LogLevel::Stderr,
        });
    }

    fn handle_response(&mut self, response: ResponseMessage) {
        let id = match response.id {
            Some(RequestId::Number(id)) => id,
            other => {
                warn!("Received response with foreign id: {other:?}");
                return;
            }
        };

        let Some(pending) = self.ledger.resolve(id) else {
            warn!("Received response for unknown request id: {id}");
            return;
        };

        if self.init_request == Some(id) {
            self.init_request = None;
            self.handle_initialize_response(response);
            return;
        }

        if self.shutdown_request == Some(id) {
            self.shutdown_request = None;
            if let Some(error) = response.error {
                warn!("Server rejected shutdown: {}", error.message);
            }
            debug!("{} server acknowledged shutdown", self.language());
            return;
        }

        if let Some(error) = response.error {
            warn!("LSP error {} for {}: {}", error.code, pending.method, error.message);
            self.emit(ConnectionEvent::RequestFailed {
                id,
                method: pending.method,
                code: Some(error.code),
                message: error.message,
            });
            return;
        }

        let result = response.result.unwrap_or(Value::Null);
        let method = pending.method.clone();
        match decode_result(pending, result) {
            Some(Ok(event)) => self.emit(event),
            Some(Err(message)) => {
                warn!("Request {id} ({method}) failed: {message}");
                self.emit(ConnectionEvent::RequestFailed {
                    id,
                    method,
                    code: None,
                    message,
                });
            }
            None => debug!("No decoder for {method} result (id {id})"),
        }
    }

    fn handle_initialize_response(&mut self, response: ResponseMessage) {
        if self.state != ConnectionState::Initializing {
            warn!("Ignoring initialize response in state {}", self.state);
            return;
        }

        if let Some(error) = response.error {
            let error = ClientError::InitializeRejected {
                server: self.binding.server_display_name().to_string(),
                code: error.code,
                message: error.message,
            };
            self.enter_error(error.to_string());
            return;
        }

        let result = response.result.unwrap_or(Value::Null);
        self.capabilities = Some(result.get("capabilities").cloned().unwrap_or_else(|| json!({})));
        self.server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Err(e) = self.queue(&NotificationMessage::new(method::INITIALIZED, json!({}))) {
            self.enter_error(e.to_string());
            return;
        }

        info!(
            "{} server initialized ({})",
            self.language(),
            self.server_name().unwrap_or(self.binding.server_display_name())
        );
        self.transition(ConnectionState::Connected);
    }

    fn handle_server_request(&mut self, request: RequestMessage) {
        debug!("Received server request: {} (id: {})", request.method, request.id);

        let response = match request.method.as_str() {
            "workspace/configuration" => {
                let items = request
                    .params
                    .get("items")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                ResponseMessage::success(request.id, Value::Array(vec![Value::Null; items]))
            }
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability" => ResponseMessage::success(request.id, Value::Null),
            other => ResponseMessage::failure(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method '{other}' not supported by client"),
            ),
        };

        if let Err(e) = self.queue(&response) {
            warn!("Failed to answer server request: {e}");
        }
    }

    fn handle_notification(&self, notification: NotificationMessage) {
        match notification.method.as_str() {
            method::PUBLISH_DIAGNOSTICS => {
                match serde_json::from_value::<PublishDiagnosticsParams>(notification.params) {
                    Ok(params) => {
                        debug!(
                            "Received {} diagnostics for {}",
                            params.diagnostics.len(),
                            params.uri.as_str()
                        );
                        self.emit(ConnectionEvent::DiagnosticsUpdated {
                            uri: params.uri.as_str().to_string(),
                            diagnostics: params.diagnostics,
                        });
                    }
                    Err(e) => warn!("Failed to parse publishDiagnostics params: {e}"),
                }
            }
            method::LOG_MESSAGE | method::SHOW_MESSAGE => {
                let text = notification
                    .params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let level = notification
                    .params
                    .get("type")
                    .and_then(Value::as_i64)
                    .map_or(LogLevel::Log, LogLevel::from_message_type);
                debug!("LSP server message: {text}");
                self.emit(ConnectionEvent::LogMessage { text, level });
            }
            "telemetry/event" => {}
            _ => trace!(
                "Ignoring notification: {} params={}",
                notification.method, notification.params
            ),
        }
    }

    // ---- outbound: raw ----

    /// Sends a request without correlation data. Results of methods that
    /// need a document position are reported as `RequestFailed`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn send_request(&mut self, method: &str, params: Value) -> Result<i64, ClientError> {
        self.send_request_with_origin(method, params, RequestOrigin::None)
    }

    /// Sends a request and records `origin` for its response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`, or
    /// [`ClientError::Encode`] if the message cannot be serialized.
    pub fn send_request_with_origin(
        &mut self,
        method: &str,
        params: Value,
        origin: RequestOrigin,
    ) -> Result<i64, ClientError> {
        self.require_connected()?;

        let id = self.ledger.register(method, origin);
        if let Err(e) = self.queue(&RequestMessage::new(id, method, params)) {
            self.ledger.resolve(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn send_notification(&mut self, method: &str, params: Value) -> Result<(), ClientError> {
        self.require_connected()?;
        self.queue(&NotificationMessage::new(method, params))
    }

    // ---- outbound: documents ----

    /// Opens a document at version 1. Returns `false` if it was already
    /// open, in which case nothing is sent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`, or
    /// [`ClientError::InvalidDocument`] for unusable locations.
    pub fn open_document(&mut self, uri: &str, text: &str) -> Result<bool, ClientError> {
        self.require_connected()?;
        let uri = document_uri(uri)?;
        let lsp_uri = parse_uri(&uri)?;

        if self.documents.is_open(&uri) {
            debug!("{uri} already open");
            return Ok(false);
        }
        self.send_did_open(lsp_uri, text)?;
        self.documents.commit(&uri, DocumentChange::Opened);
        Ok(true)
    }

    /// Replaces the full text of a document and returns its new version.
    ///
    /// Documents that are not open are opened instead, at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`, or
    /// [`ClientError::StaleVersion`] if `version` does not advance.
    pub fn update_document(
        &mut self,
        uri: &str,
        text: &str,
        version: Option<i32>,
    ) -> Result<i32, ClientError> {
        self.require_connected()?;
        let uri = document_uri(uri)?;
        let lsp_uri = parse_uri(&uri)?;

        // Recorded only once the notification is queued.
        let change = self.documents.next_change(&uri, version)?;
        match change {
            DocumentChange::Opened => {
                self.send_did_open(lsp_uri, text)?;
                self.documents.commit(&uri, change);
                Ok(1)
            }
            DocumentChange::Changed(version) => {
                let params = DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri: lsp_uri,
                        version,
                    },
                    content_changes: vec![TextDocumentContentChangeEvent {
                        range: None,
                        range_length: None,
                        text: text.to_string(),
                    }],
                };
                self.notify(method::DID_CHANGE, &params)?;
                self.documents.commit(&uri, change);
                Ok(version)
            }
        }
    }

    /// Sends `didSave` for an open document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`, or
    /// [`ClientError::DocumentNotOpen`].
    pub fn save_document(&mut self, uri: &str, text: Option<&str>) -> Result<(), ClientError> {
        self.require_connected()?;
        let uri = document_uri(uri)?;
        if !self.documents.is_open(&uri) {
            return Err(ClientError::DocumentNotOpen(uri));
        }
        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(&uri)?,
            },
            text: text.map(str::to_string),
        };
        self.notify(method::DID_SAVE, &params)
    }

    /// Closes a document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`, or
    /// [`ClientError::DocumentNotOpen`].
    pub fn close_document(&mut self, uri: &str) -> Result<(), ClientError> {
        self.require_connected()?;
        let uri = document_uri(uri)?;
        let lsp_uri = parse_uri(&uri)?;

        if !self.documents.is_open(&uri) {
            return Err(ClientError::DocumentNotOpen(uri));
        }
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: lsp_uri },
        };
        self.notify(method::DID_CLOSE, &params)?;
        self.documents.close(&uri)
    }

    // ---- outbound: typed requests ----

    /// Requests completions at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn completion(&mut self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let (uri, doc) = self.position_params(uri, position)?;
        let params = CompletionParams {
            text_document_position: doc,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        self.typed_request(method::COMPLETION, &params, RequestOrigin::Position { uri, position })
    }

    /// Requests hover information at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn hover(&mut self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let (uri, doc) = self.position_params(uri, position)?;
        let params = HoverParams {
            text_document_position_params: doc,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.typed_request(method::HOVER, &params, RequestOrigin::Position { uri, position })
    }

    /// Requests signature help at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn signature_help(&mut self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let (uri, doc) = self.position_params(uri, position)?;
        let params = SignatureHelpParams {
            context: None,
            text_document_position_params: doc,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.typed_request(
            method::SIGNATURE_HELP,
            &params,
            RequestOrigin::Position { uri, position },
        )
    }

    /// Requests the definition of the symbol at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn definition(&mut self, uri: &str, position: Position) -> Result<i64, ClientError> {
        let (uri, doc) = self.position_params(uri, position)?;
        let params = GotoDefinitionParams {
            text_document_position_params: doc,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.typed_request(method::DEFINITION, &params, RequestOrigin::Position { uri, position })
    }

    /// Requests references to the symbol at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn references(
        &mut self,
        uri: &str,
        position: Position,
        include_declaration: bool,
    ) -> Result<i64, ClientError> {
        let (uri, doc) = self.position_params(uri, position)?;
        let params = ReferenceParams {
            text_document_position: doc,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };
        self.typed_request(method::REFERENCES, &params, RequestOrigin::Position { uri, position })
    }

    /// Requests the symbol outline of a document.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn document_symbols(&mut self, uri: &str) -> Result<i64, ClientError> {
        let (uri, text_document) = self.document_params(uri)?;
        let params = DocumentSymbolParams {
            text_document,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.typed_request(method::DOCUMENT_SYMBOL, &params, RequestOrigin::Document { uri })
    }

    /// Searches workspace symbols.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn workspace_symbols(&mut self, query: &str) -> Result<i64, ClientError> {
        self.require_connected()?;
        let params = WorkspaceSymbolParams {
            query: query.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.typed_request(
            method::WORKSPACE_SYMBOL,
            &params,
            RequestOrigin::Query(query.to_string()),
        )
    }

    /// Requests code actions for `range`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn code_actions(&mut self, uri: &str, range: Range) -> Result<i64, ClientError> {
        let (uri, text_document) = self.document_params(uri)?;
        let params = CodeActionParams {
            text_document,
            range,
            context: CodeActionContext {
                diagnostics: Vec::new(),
                only: None,
                trigger_kind: None,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.typed_request(method::CODE_ACTION, &params, RequestOrigin::Range { uri, range })
    }

    /// Requests whole-document formatting.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn formatting(
        &mut self,
        uri: &str,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<i64, ClientError> {
        let (uri, text_document) = self.document_params(uri)?;
        let params = DocumentFormattingParams {
            text_document,
            options: FormattingOptions {
                tab_size,
                insert_spaces,
                ..FormattingOptions::default()
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.typed_request(method::FORMATTING, &params, RequestOrigin::Document { uri })
    }

    /// Requests a rename of the symbol at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless `Connected`.
    pub fn rename(
        &mut self,
        uri: &str,
        position: Position,
        new_name: &str,
    ) -> Result<i64, ClientError> {
        let (uri, doc) = self.position_params(uri, position)?;
        let params = RenameParams {
            text_document_position: doc,
            new_name: new_name.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.typed_request(method::RENAME, &params, RequestOrigin::Position { uri, position })
    }

    // ---- internals ----

    fn require_connected(&self) -> Result<(), ClientError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected {
                language: self.language(),
                state: self.state,
            })
        }
    }

    fn position_params(
        &self,
        uri: &str,
        position: Position,
    ) -> Result<(String, TextDocumentPositionParams), ClientError> {
        let (uri, text_document) = self.document_params(uri)?;
        Ok((
            uri,
            TextDocumentPositionParams {
                text_document,
                position,
            },
        ))
    }

    fn document_params(&self, uri: &str) -> Result<(String, TextDocumentIdentifier), ClientError> {
        self.require_connected()?;
        let uri = document_uri(uri)?;
        let identifier = TextDocumentIdentifier {
            uri: parse_uri(&uri)?,
        };
        Ok((uri, identifier))
    }

    fn typed_request<P: Serialize>(
        &mut self,
        method: &str,
        params: &P,
        origin: RequestOrigin,
    ) -> Result<i64, ClientError> {
        let params = serde_json::to_value(params)?;
        self.send_request_with_origin(method, params, origin)
    }

    fn notify<P: Serialize>(&mut self, method: &str, params: &P) -> Result<(), ClientError> {
        let params = serde_json::to_value(params)?;
        self.queue(&NotificationMessage::new(method, params))
    }

    fn send_did_open(&mut self, uri: Uri, text: &str) -> Result<(), ClientError> {
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri,
                language_id: self.binding.language_id().to_string(),
                version: 1,
                text: text.to_string(),
            },
        };
        self.notify(method::DID_OPEN, &params)
    }

    fn queue<T: Serialize>(&mut self, message: &T) -> Result<(), ClientError> {
        let frame = protocol::encode(message)?;
        trace!("Sending LSP message: {}", String::from_utf8_lossy(&frame));
        self.outbound.push(frame);
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Unexpected {} transition {} -> {next}", self.language(), self.state);
        }
        info!("{} server: {} -> {next}", self.language(), self.state);
        self.state = next;
        self.emit(ConnectionEvent::StateChanged(next));
    }

    fn enter_error(&mut self, message: String) {
        if !self.state.is_running() {
            return;
        }
        error!("{} server error: {message}", self.language());
        let dropped = self.ledger.clear();
        if dropped > 0 {
            debug!("Abandoned {dropped} pending {} requests", self.language());
        }
        self.init_request = None;
        self.shutdown_request = None;
        self.outbound.clear();
        self.transition(ConnectionState::Error);
        self.emit(ConnectionEvent::ErrorOccurred(message));
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            trace!("{} event receiver dropped", self.language());
        }
    }

    fn initialize_params(&self, workspace: &Path) -> Value {
        let root_uri = Url::from_directory_path(workspace)
            .ok()
            .map(|url| url.as_str().trim_end_matches('/').to_string());
        let name = workspace
            .file_name()
            .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().into_owned());
        let workspace_folders = root_uri
            .as_ref()
            .map(|uri| json!([{ "uri": uri, "name": name }]));

        json!({
            "processId": std::process::id(),
            "clientInfo": { "name": "grove", "version": env!("GROVE_VERSION") },
            "rootUri": root_uri,
            "rootPath": workspace.display().to_string(),
            "workspaceFolders": workspace_folders,
            "capabilities": {
                "workspace": {
                    "applyEdit": true,
                    "workspaceEdit": { "documentChanges": true },
                    "didChangeConfiguration": { "dynamicRegistration": true },
                    "symbol": { "dynamicRegistration": true },
                    "configuration": true,
                    "workspaceFolders": true
                },
                "textDocument": {
                    "synchronization": {
                        "dynamicRegistration": true,
                        "willSave": true,
                        "willSaveWaitUntil": true,
                        "didSave": true
                    },
                    "completion": {
                        "dynamicRegistration": true,
                        "completionItem": {
                            "snippetSupport": true,
                            "commitCharactersSupport": true,
                            "documentationFormat": ["markdown", "plaintext"]
                        }
                    },
                    "hover": {
                        "dynamicRegistration": true,
                        "contentFormat": ["markdown", "plaintext"]
                    },
                    "signatureHelp": { "dynamicRegistration": true },
                    "definition": { "dynamicRegistration": true, "linkSupport": true },
                    "references": { "dynamicRegistration": true },
                    "documentHighlight": { "dynamicRegistration": true },
                    "documentSymbol": {
                        "dynamicRegistration": true,
                        "hierarchicalDocumentSymbolSupport": true
                    },
                    "codeAction": { "dynamicRegistration": true },
                    "formatting": { "dynamicRegistration": true },
                    "rename": { "dynamicRegistration": true },
                    "publishDiagnostics": { "relatedInformation": true }
                },
                "window": { "workDoneProgress": true }
            },
            "initializationOptions": self.binding.initialization_options(workspace)
        })
    }
}

fn parse_uri(uri: &str) -> Result<Uri, ClientError> {
    uri.parse()
        .map_err(|e| ClientError::InvalidDocument(format!("{uri}: {e}")))
}

/// Turns a successful result into an event using the request's method and
/// origin. Returns `None` for methods without a decoder.
fn decode_result(
    pending: PendingRequest,
    result: Value,
) -> Option<Result<ConnectionEvent, String>> {
    use RequestOrigin as O;

    let PendingRequest { method, origin } = pending;
    let event = match (method.as_str(), origin) {
        (method::COMPLETION, O::Position { uri, position }) => types::decode_completion(result)
            .map(|(items, is_incomplete)| ConnectionEvent::CompletionReady {
                uri,
                position,
                items,
                is_incomplete,
            }),
        (method::HOVER, O::Position { uri, position }) => {
            types::decode_hover(result).map(|contents| ConnectionEvent::HoverReady {
                uri,
                position,
                contents,
            })
        }
        (method::SIGNATURE_HELP, O::Position { uri, position }) => {
            serde_json::from_value::<Option<SignatureHelp>>(result).map(|help| {
                ConnectionEvent::SignatureHelpReady {
                    uri,
                    position,
                    help,
                }
            })
        }
        (method::DEFINITION, O::Position { uri, position }) => types::decode_locations(result)
            .map(|locations| ConnectionEvent::DefinitionReady {
                uri,
                position,
                locations,
            }),
        (method::REFERENCES, O::Position { uri, position }) => types::decode_list::<Location>(result)
            .map(|locations| ConnectionEvent::ReferencesReady {
                uri,
                position,
                locations,
            }),
        (method::DOCUMENT_SYMBOL, O::Document { uri }) => {
            serde_json::from_value::<Option<DocumentSymbolResponse>>(result)
                .map(|symbols| ConnectionEvent::DocumentSymbolsReady { uri, symbols })
        }
        (method::WORKSPACE_SYMBOL, O::Query(query)) => {
            serde_json::from_value::<Option<WorkspaceSymbolResponse>>(result)
                .map(|symbols| ConnectionEvent::WorkspaceSymbolsReady { query, symbols })
        }
        (method::CODE_ACTION, O::Range { uri, range }) => {
            types::decode_list::<CodeActionOrCommand>(result).map(|actions| {
                ConnectionEvent::CodeActionsReady {
                    uri,
                    range,
                    actions,
                }
            })
        }
        (method::FORMATTING, O::Document { uri }) => types::decode_list::<TextEdit>(result)
            .map(|edits| ConnectionEvent::FormattingReady { uri, edits }),
        (method::RENAME, O::Position { uri, position }) => {
            serde_json::from_value::<Option<WorkspaceEdit>>(result).map(|edit| {
                ConnectionEvent::RenameReady {
                    uri,
                    position,
                    edit,
                }
            })
        }
        (m, _) if DECODED_METHODS.contains(&m) => {
            return Some(Err(format!(
                "uncorrelated {m} response: request carried no document or position"
            )));
        }
        _ => return None,
    };

    Some(event.map_err(|e| format!("invalid {method} result: {e}")))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Tests use expect/unwrap/panic for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::lsp::binding::Language;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn new_connection() -> (Connection, UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = LanguageBinding::new(Language::Cpp).with_server_path("/usr/bin/clangd");
        (Connection::new(binding, tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[ConnectionEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn written(conn: &mut Connection) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        conn.take_outbound()
            .iter()
            .flat_map(|frame| decoder.feed(frame))
            .collect()
    }

    fn frame(value: &Value) -> Vec<u8> {
        protocol::encode(value).unwrap().to_vec()
    }

    fn connected() -> (Connection, UnboundedReceiver<ConnectionEvent>) {
        let (mut conn, mut rx) = new_connection();
        conn.begin_start(Path::new("/ws/project")).unwrap();
        conn.spawned();
        conn.take_outbound();
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "capabilities": { "hoverProvider": true }, "serverInfo": { "name": "clangd" } }
        })));
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.take_outbound();
        drain(&mut rx);
        (conn, rx)
    }

    const POS: Position = Position {
        line: 3,
        character: 7,
    };

    #[test]
    fn test_start_handshake_reaches_connected() {
        let (mut conn, mut rx) = new_connection();

        let command = conn.begin_start(Path::new("/ws/project")).unwrap();
        assert_eq!(command.program, PathBuf::from("/usr/bin/clangd"));
        conn.spawned();

        let sent = written(&mut conn);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], "initialize");
        assert_eq!(sent[0]["id"], 1);
        assert_eq!(sent[0]["params"]["rootUri"], "file:///ws/project");
        assert_eq!(
            sent[0]["params"]["initializationOptions"]["clangd"]["fallbackFlags"]["flags"][0],
            "-I/ws/project"
        );
        assert_eq!(
            states(&drain(&mut rx)),
            vec![ConnectionState::Starting, ConnectionState::Initializing]
        );

        conn.receive(&frame(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "capabilities": { "completionProvider": {} } }
        })));

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(states(&drain(&mut rx)), vec![ConnectionState::Connected]);
        assert!(conn.capabilities().is_some());
        assert!(conn.server_capabilities().and_then(|c| c.completion_provider).is_some());
        assert_eq!(conn.pending_requests(), 0);

        let sent = written(&mut conn);
        assert_eq!(sent, vec![json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} })]);
    }

    #[test]
    fn test_start_while_connected_fails_without_side_effects() {
        let (mut conn, mut rx) = connected();
        let err = conn.begin_start(Path::new("/elsewhere")).unwrap_err();
        assert!(matches!(err, ClientError::AlreadyStarted { .. }));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.workspace(), Some(Path::new("/ws/project")));
        assert!(drain(&mut rx).is_empty());
        assert!(conn.take_outbound().is_empty());
    }

    #[test]
    fn test_start_without_executable_stays_disconnected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let binding = LanguageBinding::new(Language::Cpp).with_server_path("");
        let mut conn = Connection::new(binding, tx);

        let err = conn.begin_start(Path::new("/ws")).unwrap_err();
        assert!(matches!(err, ClientError::NoExecutable { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let events = drain(&mut rx);
        assert!(states(&events).is_empty());
        assert!(matches!(&events[..], [ConnectionEvent::ErrorOccurred(_)]));
    }

    #[test]
    fn test_spawn_failure_enters_error() {
        let (mut conn, mut rx) = new_connection();
        conn.begin_start(Path::new("/ws")).unwrap();
        conn.spawn_failed(&ClientError::Spawn {
            server: "clangd".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });

        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![ConnectionState::Starting, ConnectionState::Error]);
        assert!(matches!(events.last(), Some(ConnectionEvent::ErrorOccurred(m)) if m.contains("clangd")));
    }

    #[test]
    fn test_init_timeout_enters_error_and_abandons_ledger() {
        let (mut conn, mut rx) = new_connection();
        conn.begin_start(Path::new("/ws")).unwrap();
        conn.spawned();
        assert_eq!(conn.pending_requests(), 1);

        assert!(conn.init_timed_out(Duration::from_secs(10)));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(conn.pending_requests(), 0);

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(ConnectionEvent::ErrorOccurred(m)) if m.contains("did not finish initializing")
        ));

        // A late initialize response is an anomaly, not a transition.
        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": 1, "result": { "capabilities": {} } })));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(!conn.init_timed_out(Duration::from_secs(10)));
    }

    #[test]
    fn test_initialize_error_response_enters_error() {
        let (mut conn, mut rx) = new_connection();
        conn.begin_start(Path::new("/ws")).unwrap();
        conn.spawned();
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": 1, "error": { "code": -32603, "message": "bad root" }
        })));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ErrorOccurred(m) if m.contains("bad root"))));
    }

    #[test]
    fn test_open_update_update_reaches_version_three() {
        let (mut conn, _rx) = connected();

        assert!(conn.open_document("file:///a.cpp", "int x;").unwrap());
        assert_eq!(conn.update_document("file:///a.cpp", "int x = 1;", None).unwrap(), 2);
        assert_eq!(conn.update_document("file:///a.cpp", "int x = 2;", None).unwrap(), 3);
        assert_eq!(conn.document_version("file:///a.cpp"), Some(3));

        let sent = written(&mut conn);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0]["method"], "textDocument/didOpen");
        assert_eq!(sent[0]["params"]["textDocument"]["languageId"], "cpp");
        assert_eq!(sent[0]["params"]["textDocument"]["version"], 1);
        assert_eq!(sent[2]["method"], "textDocument/didChange");
        assert_eq!(sent[2]["params"]["textDocument"]["version"], 3);
        assert_eq!(sent[2]["params"]["contentChanges"][0]["text"], "int x = 2;");
    }

    #[test]
    fn test_rejected_update_sends_and_records_nothing() {
        let (mut conn, _rx) = connected();
        conn.open_document("file:///a.cpp", "int x;").unwrap();
        assert_eq!(
            conn.update_document("file:///a.cpp", "int x;", Some(i32::MAX)).unwrap(),
            i32::MAX
        );
        conn.take_outbound();

        assert!(matches!(
            conn.update_document("file:///a.cpp", "int y;", None),
            Err(ClientError::VersionOverflow(_))
        ));
        assert!(matches!(
            conn.update_document("file:///a.cpp", "int y;", Some(3)),
            Err(ClientError::StaleVersion { .. })
        ));
        assert!(conn.take_outbound().is_empty());
        assert_eq!(conn.document_version("file:///a.cpp"), Some(i32::MAX));
    }

    #[test]
    fn test_reopen_sends_nothing() {
        let (mut conn, _rx) = connected();
        assert!(conn.open_document("file:///a.cpp", "int x;").unwrap());
        conn.take_outbound();
        assert!(!conn.open_document("file:///a.cpp", "int y;").unwrap());
        assert!(conn.take_outbound().is_empty());
        assert_eq!(conn.document_version("file:///a.cpp"), Some(1));
    }

    #[test]
    fn test_update_of_unopened_document_opens_it() {
        let (mut conn, _rx) = connected();
        assert_eq!(conn.update_document("file:///b.cpp", "x", Some(9)).unwrap(), 1);
        let sent = written(&mut conn);
        assert_eq!(sent[0]["method"], "textDocument/didOpen");
    }

    #[test]
    fn test_close_then_reopen_resets_version() {
        let (mut conn, _rx) = connected();
        conn.open_document("file:///a.cpp", "").unwrap();
        conn.update_document("file:///a.cpp", "1", None).unwrap();
        conn.close_document("file:///a.cpp").unwrap();
        assert!(matches!(
            conn.close_document("file:///a.cpp"),
            Err(ClientError::DocumentNotOpen(_))
        ));
        conn.open_document("file:///a.cpp", "").unwrap();
        assert_eq!(conn.document_version("file:///a.cpp"), Some(1));
    }

    #[test]
    fn test_save_requires_open_document() {
        let (mut conn, _rx) = connected();
        assert!(matches!(
            conn.save_document("file:///a.cpp", None),
            Err(ClientError::DocumentNotOpen(_))
        ));
        conn.open_document("file:///a.cpp", "x").unwrap();
        conn.take_outbound();
        conn.save_document("file:///a.cpp", Some("x")).unwrap();
        let sent = written(&mut conn);
        assert_eq!(sent[0]["method"], "textDocument/didSave");
        assert_eq!(sent[0]["params"]["text"], "x");
    }

    #[test]
    fn test_operations_while_disconnected_do_not_mutate() {
        let (mut conn, _rx) = new_connection();

        assert!(matches!(
            conn.open_document("file:///a.cpp", ""),
            Err(ClientError::NotConnected { .. })
        ));
        assert!(matches!(
            conn.update_document("file:///a.cpp", "", None),
            Err(ClientError::NotConnected { .. })
        ));
        assert!(matches!(conn.hover("file:///a.cpp", POS), Err(ClientError::NotConnected { .. })));
        assert!(matches!(
            conn.send_notification("custom/ping", Value::Null),
            Err(ClientError::NotConnected { .. })
        ));
        assert!(matches!(
            conn.workspace_symbols("main"),
            Err(ClientError::NotConnected { .. })
        ));

        assert_eq!(conn.pending_requests(), 0);
        assert!(conn.open_documents().is_empty());
        assert!(conn.take_outbound().is_empty());
    }

    #[test]
    fn test_request_ids_strictly_increase() {
        let (mut conn, _rx) = connected();
        let a = conn.hover("file:///a.cpp", POS).unwrap();
        let b = conn.completion("file:///a.cpp", POS).unwrap();
        let c = conn.send_request("custom/thing", json!({})).unwrap();
        assert!(a < b && b < c);
        assert_eq!(a, 2);
        assert_eq!(conn.pending_requests(), 3);
    }

    #[test]
    fn test_completion_response_fires_event_and_resolves_ledger() {
        let (mut conn, mut rx) = connected();
        conn.hover("file:///a.cpp", POS).unwrap();
        conn.definition("file:///a.cpp", POS).unwrap();
        conn.references("file:///a.cpp", POS, true).unwrap();
        let id = conn.completion("file:///a.cpp", POS).unwrap();
        assert_eq!(id, 5);

        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": 5, "result": { "items": [] } })));

        assert!(!conn.is_pending(5));
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionEvent::CompletionReady {
                uri: "file:///a.cpp".into(),
                position: POS,
                items: Vec::new(),
                is_incomplete: false,
            }]
        );
    }

    #[test]
    fn test_out_of_order_responses_correlate_by_id() {
        let (mut conn, mut rx) = connected();
        let hover = conn.hover("file:///a.cpp", POS).unwrap();
        let completion = conn.completion("file:///b.cpp", POS).unwrap();

        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": completion, "result": [{ "label": "foo" }]
        })));
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": hover, "result": { "contents": "int x" }
        })));

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            ConnectionEvent::CompletionReady { uri, items, .. } if uri == "file:///b.cpp" && items[0].label == "foo"
        ));
        assert!(matches!(
            &events[1],
            ConnectionEvent::HoverReady { uri, contents, .. } if uri == "file:///a.cpp" && contents == "int x"
        ));
    }

    #[test]
    fn test_unknown_response_id_is_ignored() {
        let (mut conn, mut rx) = connected();
        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": 99, "result": null })));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_error_response_is_reported_without_state_change() {
        let (mut conn, mut rx) = connected();
        let id = conn.hover("file:///a.cpp", POS).unwrap();
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": id, "error": { "code": -32602, "message": "bad position" }
        })));
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionEvent::RequestFailed {
                id,
                method: "textDocument/hover".into(),
                code: Some(-32602),
                message: "bad position".into(),
            }]
        );
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(!conn.is_pending(id));
    }

    #[test]
    fn test_uncorrelated_response_is_explicit_failure() {
        let (mut conn, mut rx) = connected();
        let id = conn.send_request("textDocument/hover", json!({})).unwrap();
        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": id, "result": null })));
        assert!(matches!(
            &drain(&mut rx)[..],
            [ConnectionEvent::RequestFailed { message, code: None, .. }] if message.contains("uncorrelated")
        ));
    }

    #[test]
    fn test_raw_request_without_decoder_emits_nothing() {
        let (mut conn, mut rx) = connected();
        let id = conn
            .send_request("textDocument/declaration", json!({}))
            .unwrap();
        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": id, "result": [] })));
        assert!(!conn.is_pending(id));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_undecodable_result_is_reported() {
        let (mut conn, mut rx) = connected();
        let id = conn.formatting("file:///a.cpp", 4, true).unwrap();
        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": id, "result": "nope" })));
        assert!(matches!(
            &drain(&mut rx)[..],
            [ConnectionEvent::RequestFailed { message, .. }] if message.starts_with("invalid textDocument/formatting")
        ));
    }

    #[test]
    fn test_typed_results_are_delivered() {
        let (mut conn, mut rx) = connected();
        let range = Range::new(Position::new(0, 0), Position::new(0, 3));

        let symbols = conn.document_symbols("file:///a.cpp").unwrap();
        let workspace = conn.workspace_symbols("main").unwrap();
        let actions = conn.code_actions("file:///a.cpp", range).unwrap();
        let rename = conn.rename("file:///a.cpp", POS, "y").unwrap();
        let help = conn.signature_help("file:///a.cpp", POS).unwrap();

        for id in [symbols, workspace, actions, rename, help] {
            conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": id, "result": null })));
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], ConnectionEvent::DocumentSymbolsReady { symbols: None, .. }));
        assert!(matches!(&events[1], ConnectionEvent::WorkspaceSymbolsReady { query, .. } if query == "main"));
        assert!(matches!(&events[2], ConnectionEvent::CodeActionsReady { actions, range: r, .. } if actions.is_empty() && *r == range));
        assert!(matches!(&events[3], ConnectionEvent::RenameReady { edit: None, .. }));
        assert!(matches!(&events[4], ConnectionEvent::SignatureHelpReady { help: None, .. }));
    }

    #[test]
    fn test_server_requests_are_answered() {
        let (mut conn, _rx) = connected();
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": 7, "method": "workspace/configuration",
            "params": { "items": [{ "section": "a" }, { "section": "b" }] }
        })));
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": "tok", "method": "window/workDoneProgress/create",
            "params": { "token": "x" }
        })));
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "id": 8, "method": "workspace/applyEdit", "params": {}
        })));

        let sent = written(&mut conn);
        assert_eq!(sent[0], json!({ "jsonrpc": "2.0", "id": 7, "result": [null, null] }));
        assert_eq!(sent[1], json!({ "jsonrpc": "2.0", "id": "tok", "result": null }));
        assert_eq!(sent[2]["id"], 8);
        assert_eq!(sent[2]["error"]["code"], -32601);
        assert_eq!(conn.pending_requests(), 0);
    }

    #[test]
    fn test_notifications_become_events() {
        let (mut conn, mut rx) = connected();
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": "file:///a.cpp",
                "diagnostics": [{
                    "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
                    "severity": 1,
                    "message": "expected ';'"
                }]
            }
        })));
        conn.receive(&frame(&json!({
            "jsonrpc": "2.0", "method": "window/logMessage", "params": { "type": 2, "message": "careful" }
        })));
        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "method": "$/unknown", "params": {} })));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ConnectionEvent::DiagnosticsUpdated { uri, diagnostics } if uri == "file:///a.cpp" && diagnostics[0].message == "expected ';'"
        ));
        assert_eq!(
            events[1],
            ConnectionEvent::LogMessage {
                text: "careful".into(),
                level: LogLevel::Warning,
            }
        );
    }

    #[test]
    fn test_process_loss_forces_error() {
        let (mut conn, mut rx) = connected();
        conn.open_document("file:///a.cpp", "").unwrap();
        conn.hover("file:///a.cpp", POS).unwrap();

        assert!(conn.process_lost("exit status: 1"));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(conn.pending_requests(), 0);
        assert!(matches!(
            conn.hover("file:///a.cpp", POS),
            Err(ClientError::NotConnected { state: ConnectionState::Error, .. })
        ));

        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![ConnectionState::Error]);
        assert!(!conn.process_lost("again"));
    }

    #[test]
    fn test_graceful_stop_sequence() {
        let (mut conn, mut rx) = connected();
        conn.open_document("file:///a.cpp", "").unwrap();
        conn.take_outbound();

        assert!(conn.begin_shutdown());
        let sent = written(&mut conn);
        assert_eq!(sent[0]["method"], "shutdown");
        let id = sent[0]["id"].as_i64().unwrap();

        conn.receive(&frame(&json!({ "jsonrpc": "2.0", "id": id, "result": null })));
        assert!(!conn.shutdown_pending());

        conn.send_exit();
        assert_eq!(written(&mut conn)[0]["method"], "exit");

        conn.finish_stop();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.open_documents().is_empty());
        assert!(conn.capabilities().is_none());
        assert_eq!(states(&drain(&mut rx)), vec![ConnectionState::Disconnected]);

        // A fresh session starts cleanly.
        conn.begin_start(Path::new("/ws/project")).unwrap();
        conn.spawned();
        let sent = written(&mut conn);
        assert_eq!(sent[0]["method"], "initialize");
        assert!(sent[0]["id"].as_i64().unwrap() > id);
    }

    #[test]
    fn test_stop_from_error_skips_shutdown() {
        let (mut conn, _rx) = connected();
        conn.process_lost("gone");
        assert!(!conn.begin_shutdown());
        conn.send_exit();
        assert!(conn.take_outbound().is_empty());
        conn.finish_stop();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stderr_lines_are_forwarded() {
        let (conn, mut rx) = new_connection();
        conn.stderr_line("I[10:00:00.000] clangd version 18".into());
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionEvent::LogMessage {
                text: "I[10:00:00.000] clangd version 18".into(),
                level: LogLevel::Stderr,
            }]
        );
    }
}
