// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Events delivered to consumers of a connection.

use lsp_types::{
    CodeActionOrCommand, Diagnostic, DocumentSymbolResponse, Location, Position, Range,
    SignatureHelp, TextEdit, WorkspaceEdit, WorkspaceSymbolResponse,
};

use super::binding::Language;
use super::state::ConnectionState;
use super::types::{CompletionEntry, LogLevel};

/// Something a single connection wants its consumer to know.
///
/// Results are delivered with the coordinates the caller supplied when the
/// request was made, not with the raw request id.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection moved to a new lifecycle state.
    StateChanged(ConnectionState),
    /// The connection entered `Error`. Always follows the matching
    /// `StateChanged`.
    ErrorOccurred(String),
    /// Completion candidates.
    CompletionReady {
        /// Document URI.
        uri: String,
        /// Requested position.
        position: Position,
        /// Candidates in server order.
        items: Vec<CompletionEntry>,
        /// Whether the server may return more on further typing.
        is_incomplete: bool,
    },
    /// Hover text, empty when the server had nothing to say.
    HoverReady {
        /// Document URI.
        uri: String,
        /// Requested position.
        position: Position,
        /// Flattened hover contents.
        contents: String,
    },
    /// Signature help, if any.
    SignatureHelpReady {
        /// Document URI.
        uri: String,
        /// Requested position.
        position: Position,
        /// Active signatures.
        help: Option<SignatureHelp>,
    },
    /// Definition targets.
    DefinitionReady {
        /// Document URI.
        uri: String,
        /// Requested position.
        position: Position,
        /// Target locations.
        locations: Vec<Location>,
    },
    /// Reference locations.
    ReferencesReady {
        /// Document URI.
        uri: String,
        /// Requested position.
        position: Position,
        /// Reference locations.
        locations: Vec<Location>,
    },
    /// Symbols of one document.
    DocumentSymbolsReady {
        /// Document URI.
        uri: String,
        /// Flat or nested symbols, `None` for a `null` result.
        symbols: Option<DocumentSymbolResponse>,
    },
    /// Workspace symbol search results.
    WorkspaceSymbolsReady {
        /// Query string sent.
        query: String,
        /// Matching symbols.
        symbols: Option<WorkspaceSymbolResponse>,
    },
    /// Code actions for a range.
    CodeActionsReady {
        /// Document URI.
        uri: String,
        /// Requested range.
        range: Range,
        /// Actions and commands.
        actions: Vec<CodeActionOrCommand>,
    },
    /// Whole-document formatting edits.
    FormattingReady {
        /// Document URI.
        uri: String,
        /// Edits to apply.
        edits: Vec<TextEdit>,
    },
    /// Rename edits.
    RenameReady {
        /// Document URI.
        uri: String,
        /// Requested position.
        position: Position,
        /// Edit to apply, `None` when the server declined.
        edit: Option<WorkspaceEdit>,
    },
    /// The server published diagnostics for a document.
    DiagnosticsUpdated {
        /// Document URI.
        uri: String,
        /// Current diagnostics, replacing any earlier set.
        diagnostics: Vec<Diagnostic>,
    },
    /// A log line from the server.
    LogMessage {
        /// Message text.
        text: String,
        /// Severity.
        level: LogLevel,
    },
    /// A request failed: the server returned an error object, the result
    /// could not be decoded, or it could not be correlated with its origin.
    RequestFailed {
        /// Request id.
        id: i64,
        /// Request method.
        method: String,
        /// JSON-RPC error code, when the server sent one.
        code: Option<i64>,
        /// Description.
        message: String,
    },
}

/// A [`ConnectionEvent`] tagged with the language of its connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    /// Language of the originating connection.
    pub language: Language,
    /// The event.
    pub event: ConnectionEvent,
}
