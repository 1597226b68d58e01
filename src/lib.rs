// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Grove drives C++ and Java language servers over stdio.
//!
//! Each language gets one connection that spawns its server, performs the
//! `initialize` handshake, tracks open documents and outstanding requests,
//! and turns server output into typed events. A manager routes files to the
//! right connection by extension and merges their events into one stream.

/// Layered configuration.
pub mod config;
/// Error types and their categories.
pub mod error;
/// Language server client engine.
pub mod lsp;

pub use error::{ClientError, ErrorCategory};
