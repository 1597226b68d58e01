// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error types surfaced to callers of the client engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lsp::binding::Language;
use crate::lsp::state::ConnectionState;

/// Broad failure classes. Each class has a fixed effect on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The server process failed to spawn, died, or could not be written to.
    /// Forces `Error`; requires an explicit restart.
    Transport,
    /// Malformed traffic. Recovered locally.
    Protocol,
    /// The server answered with a JSON-RPC error object.
    Application,
    /// Nothing to launch. The connection stays `Disconnected`.
    Configuration,
    /// The handshake deadline passed. Forces `Error`.
    Timeout,
    /// The caller invoked an operation that is illegal in the current state.
    Usage,
}

/// Errors returned by connection, client and manager operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation requires a `Connected` connection.
    #[error("{language} server is not connected (state: {state})")]
    NotConnected {
        /// Language of the connection.
        language: Language,
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// `start` was called on a connection that is not `Disconnected`.
    #[error("{language} server already started (state: {state})")]
    AlreadyStarted {
        /// Language of the connection.
        language: Language,
        /// State at the time of the call.
        state: ConnectionState,
    },

    /// No server executable could be resolved.
    #[error("no executable configured or found for {server}")]
    NoExecutable {
        /// Display name of the server.
        server: String,
    },

    /// The JVM server install contains no launcher jar.
    #[error("no launcher jar found for {server} in {}", dir.display())]
    LauncherNotFound {
        /// Display name of the server.
        server: String,
        /// Install directory that was searched.
        dir: PathBuf,
    },

    /// No Java runtime could be resolved for a JVM-hosted server.
    #[error("no Java runtime found for {server}; set java_home or JAVA_HOME")]
    JavaNotFound {
        /// Display name of the server.
        server: String,
    },

    /// The server process could not be spawned.
    #[error("failed to spawn {server}: {source}")]
    Spawn {
        /// Display name of the server.
        server: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The server process exited or its pipes closed.
    #[error("{server} terminated unexpectedly: {detail}")]
    ProcessExited {
        /// Display name of the server.
        server: String,
        /// Exit status or pipe condition.
        detail: String,
    },

    /// The handshake did not complete in time.
    #[error("{server} did not finish initializing within {timeout:?}")]
    InitTimeout {
        /// Display name of the server.
        server: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The server rejected the `initialize` request.
    #[error("{server} rejected initialize: {message} (code {code})")]
    InitializeRejected {
        /// Display name of the server.
        server: String,
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the server.
        message: String,
    },

    /// The document is not registered.
    #[error("document not open: {0}")]
    DocumentNotOpen(String),

    /// An explicit version did not advance the document.
    #[error("stale version {requested} for {uri} (current {current})")]
    StaleVersion {
        /// Document URI.
        uri: String,
        /// Version currently registered.
        current: i32,
        /// Version supplied by the caller.
        requested: i32,
    },

    /// The document is already at the highest representable version.
    #[error("version of {0} cannot advance past {max}", max = i32::MAX)]
    VersionOverflow(String),

    /// The path or URI could not be turned into a `file://` URI.
    #[error("invalid document location: {0}")]
    InvalidDocument(String),

    /// The file extension maps to no supported language.
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),

    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The client actor has shut down.
    #[error("client task has shut down")]
    ClientClosed,

    /// `wait_until_connected` gave up.
    #[error("{language} server not connected after {timeout:?} (state: {state})")]
    ConnectTimeout {
        /// Language of the connection.
        language: Language,
        /// How long the caller waited.
        timeout: Duration,
        /// State when the wait ended.
        state: ConnectionState,
    },
}

impl ClientError {
    /// Returns the failure class of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Spawn { .. } | Self::ProcessExited { .. } | Self::ClientClosed => {
                ErrorCategory::Transport
            }
            Self::InitTimeout { .. } | Self::ConnectTimeout { .. } => ErrorCategory::Timeout,
            Self::InitializeRejected { .. } => ErrorCategory::Application,
            Self::NoExecutable { .. }
            | Self::LauncherNotFound { .. }
            | Self::JavaNotFound { .. }
            | Self::UnsupportedExtension(_) => ErrorCategory::Configuration,
            Self::Encode(_) => ErrorCategory::Protocol,
            Self::NotConnected { .. }
            | Self::AlreadyStarted { .. }
            | Self::DocumentNotOpen(_)
            | Self::StaleVersion { .. }
            | Self::VersionOverflow(_)
            | Self::InvalidDocument(_) => ErrorCategory::Usage,
        }
    }

    /// Whether this error leaves the connection in `Error`.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Timeout
        ) && !matches!(self, Self::ConnectTimeout { .. } | Self::ClientClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let not_connected = ClientError::NotConnected {
            language: Language::Cpp,
            state: ConnectionState::Disconnected,
        };
        assert_eq!(not_connected.category(), ErrorCategory::Usage);
        assert!(!not_connected.is_fatal());

        let launcher = ClientError::LauncherNotFound {
            server: "Eclipse JDT Language Server".into(),
            dir: PathBuf::from("/opt/jdtls"),
        };
        assert_eq!(launcher.category(), ErrorCategory::Configuration);

        let timeout = ClientError::InitTimeout {
            server: "clangd".into(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert!(timeout.is_fatal());

        let exited = ClientError::ProcessExited {
            server: "clangd".into(),
            detail: "exit status: 1".into(),
        };
        assert!(exited.is_fatal());
    }

    #[test]
    fn test_messages_are_readable() {
        let err = ClientError::NotConnected {
            language: Language::Java,
            state: ConnectionState::Error,
        };
        assert_eq!(err.to_string(), "java server is not connected (state: error)");

        let err = ClientError::StaleVersion {
            uri: "file:///a.cpp".into(),
            current: 4,
            requested: 2,
        };
        assert_eq!(
            err.to_string(),
            "stale version 2 for file:///a.cpp (current 4)"
        );
    }
}
