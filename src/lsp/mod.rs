// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Language server client engine.
//!
//! Layers, bottom up: framing and message classification ([`protocol`]),
//! per-connection bookkeeping ([`ledger`], [`documents`], [`state`]), the
//! sans-IO [`connection::Connection`], the process-driving
//! [`client::LspClient`], and the per-language [`manager::ClientManager`].

/// Per-language launch strategies and server discovery.
pub mod binding;
/// Async handle and driver task for one connection.
pub mod client;
/// The per-language connection state machine.
pub mod connection;
/// Open document versions and URI handling.
pub mod documents;
/// Events delivered to consumers.
pub mod events;
/// Outstanding request bookkeeping.
pub mod ledger;
/// One client per language, routing and workspace detection.
pub mod manager;
/// Server child process.
pub mod process;
/// JSON-RPC envelopes and `Content-Length` framing.
pub mod protocol;
/// Connection lifecycle states.
pub mod state;
/// Result types handed to consumers and their decoders.
pub mod types;

pub use binding::{Language, LanguageBinding, LaunchCommand};
pub use client::LspClient;
pub use connection::Connection;
pub use events::{ClientEvent, ConnectionEvent};
pub use manager::{ClientManager, detect_workspace_languages};
pub use state::ConnectionState;
pub use types::{CompletionEntry, LogLevel, RequestOrigin};
