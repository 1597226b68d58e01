// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A scriptable stand-in for clangd and JDT LS.
//!
//! Speaks Content-Length framed JSON-RPC on stdin/stdout and answers the
//! requests the engine sends with results computed from the open document
//! text. CLI flags inject delays, hangs, errors, crashes and unsolicited
//! server requests. No tokio; deferred notifications use `std::thread`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Mock language server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
#[allow(
    clippy::struct_excessive_bools,
    reason = "CLI flags are inherently boolean"
)]
#[allow(dead_code, reason = "clangd flags are parsed and ignored")]
struct Args {
    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Delay before publishing diagnostics (milliseconds).
    #[arg(long, default_value_t = 0)]
    diagnostics_delay: u64,

    /// Never publish diagnostics.
    #[arg(long)]
    no_diagnostics: bool,

    /// Only publish diagnostics on `didSave`.
    #[arg(long)]
    diagnostics_on_save: bool,

    /// Exit with status 1 after sending n responses.
    #[arg(long)]
    drop_after: Option<u64>,

    /// Exit with status 3 right after receiving `initialized`.
    #[arg(long)]
    exit_after_initialized: bool,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Send `workspace/configuration` after answering `initialize`.
    #[arg(long)]
    send_configuration_request: bool,

    /// Send a request for a method no client implements after `initialize`.
    #[arg(long)]
    send_unknown_request: bool,

    /// Send `window/logMessage` after `initialized`.
    #[arg(long)]
    log_message: Option<String>,

    /// Write a line to stderr on startup.
    #[arg(long)]
    stderr_banner: Option<String>,

    /// Write frames in small pieces, flushing each.
    #[arg(long)]
    split_writes: bool,

    /// Accepted for clangd compatibility.
    #[arg(long, hide = true)]
    log: Option<String>,

    /// Accepted for clangd compatibility.
    #[arg(long, hide = true)]
    pretty: bool,

    /// Accepted for clangd compatibility.
    #[arg(long, hide = true)]
    limit_results: Option<u32>,

    /// Accepted for clangd compatibility.
    #[arg(long, hide = true)]
    background_index: bool,

    /// Accepted for clangd compatibility.
    #[arg(long, hide = true)]
    compile_commands_dir: Option<String>,
}

/// An incoming JSON-RPC message.
#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Response {
    const fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    const fn err(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Shared output handle: stdout in production, a buffer in tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An open document as the mock sees it.
struct Document {
    language_id: String,
    version: i64,
    text: String,
}

struct MockServer {
    args: Args,
    documents: HashMap<String, Document>,
    response_count: u64,
    writer: Writer,
    next_request_id: AtomicU64,
    shut_down: bool,
}

impl MockServer {
    fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            documents: HashMap::new(),
            response_count: 0,
            writer,
            next_request_id: AtomicU64::new(1),
            shut_down: false,
        }
    }

    fn run(&mut self, reader: &mut dyn Read) {
        if let Some(banner) = &self.args.stderr_banner {
            eprintln_banner(banner);
        }

        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((body, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);
                let Ok(message) = serde_json::from_str::<Incoming>(&body) else {
                    continue;
                };
                self.handle_message(message);
            }
        }
    }

    fn handle_message(&mut self, message: Incoming) {
        match (message.method, message.id) {
            (Some(method), Some(id)) => self.handle_request(&method, id, &message.params),
            (Some(method), None) => self.handle_notification(&method, &message.params),
            // Answers to our own requests are ignored.
            (None, _) => {}
        }
    }

    fn handle_request(&mut self, method: &str, id: Value, params: &Value) {
        if self.args.hang_on.iter().any(|m| m == method) {
            return;
        }
        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }
        if self.args.fail_on.iter().any(|m| m == method) {
            self.send_response(&Response::err(
                id,
                -32603,
                format!("mockls: configured to fail on {method}"),
            ));
            return;
        }

        let result = match method {
            "initialize" => Some(initialize_result()),
            "shutdown" => {
                self.shut_down = true;
                Some(Value::Null)
            }
            "textDocument/hover" => Some(self.hover(params)),
            "textDocument/completion" => Some(self.completion(params)),
            "textDocument/signatureHelp" => Some(self.signature_help(params)),
            "textDocument/definition" => Some(self.definition(params)),
            "textDocument/references" => Some(self.references(params)),
            "textDocument/documentSymbol" => Some(self.document_symbols(params)),
            "workspace/symbol" => Some(self.workspace_symbols(params)),
            "textDocument/codeAction" => Some(code_actions(params)),
            "textDocument/formatting" => Some(self.formatting(params)),
            "textDocument/rename" => Some(self.rename(params)),
            _ => None,
        };

        match result {
            Some(result) => self.send_response(&Response::ok(id, result)),
            None => self.send_response(&Response::err(
                id,
                -32601,
                format!("mockls: method not found: {method}"),
            )),
        }

        if method == "initialize" {
            if self.args.send_configuration_request {
                self.send_request("workspace/configuration", &json!({
                    "items": [{ "section": "clangd" }, { "section": "java" }]
                }));
            }
            if self.args.send_unknown_request {
                self.send_request("mockls/unsupported", &json!({}));
            }
        }
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "initialized" => {
                if self.args.exit_after_initialized {
                    std::process::exit(3);
                }
                if let Some(text) = &self.args.log_message {
                    send_message(
                        &self.writer,
                        self.args.split_writes,
                        &json!({
                            "jsonrpc": "2.0",
                            "method": "window/logMessage",
                            "params": { "type": 3, "message": text }
                        }),
                    );
                }
            }
            "textDocument/didOpen" => {
                let Some(item) = params.get("textDocument") else {
                    return;
                };
                let uri = str_field(item, "uri").to_string();
                self.documents.insert(
                    uri.clone(),
                    Document {
                        language_id: str_field(item, "languageId").to_string(),
                        version: item.get("version").and_then(Value::as_i64).unwrap_or(0),
                        text: str_field(item, "text").to_string(),
                    },
                );
                if !self.args.diagnostics_on_save {
                    self.publish_diagnostics(&uri);
                }
            }
            "textDocument/didChange" => {
                let Some(id) = params.get("textDocument") else {
                    return;
                };
                let uri = str_field(id, "uri").to_string();
                let text = params
                    .get("contentChanges")
                    .and_then(Value::as_array)
                    .and_then(|changes| changes.last())
                    .map(|change| str_field(change, "text").to_string());
                if let Some(doc) = self.documents.get_mut(&uri) {
                    doc.version = id.get("version").and_then(Value::as_i64).unwrap_or(doc.version);
                    if let Some(text) = text {
                        doc.text = text;
                    }
                }
                if !self.args.diagnostics_on_save {
                    self.publish_diagnostics(&uri);
                }
            }
            "textDocument/didSave" => {
                let uri = params
                    .get("textDocument")
                    .map(|id| str_field(id, "uri").to_string())
                    .unwrap_or_default();
                self.publish_diagnostics(&uri);
            }
            "textDocument/didClose" => {
                if let Some(id) = params.get("textDocument") {
                    self.documents.remove(str_field(id, "uri"));
                }
            }
            "exit" => {
                std::process::exit(if self.shut_down { 0 } else { 1 });
            }
            _ => {}
        }
    }

    fn word_at<'a>(&'a self, params: &'a Value) -> Option<(&'a str, &'a Document, String)> {
        let (uri, line, col) = extract_position(params)?;
        let doc = self.documents.get(uri)?;
        let word = extract_word(&doc.text, line, col)?;
        Some((uri, doc, word))
    }

    fn hover(&self, params: &Value) -> Value {
        let Some((_, doc, word)) = self.word_at(params) else {
            return Value::Null;
        };
        json!({
            "contents": {
                "kind": "markdown",
                "value": format!("```{}\n{word}\n```", doc.language_id)
            }
        })
    }

    fn completion(&self, params: &Value) -> Value {
        let Some((uri, line, col)) = extract_position(params) else {
            return json!({ "isIncomplete": false, "items": [] });
        };
        let Some(doc) = self.documents.get(uri) else {
            return json!({ "isIncomplete": false, "items": [] });
        };
        let prefix = word_prefix(&doc.text, line, col);

        let items: Vec<Value> = extract_symbols(&doc.text)
            .into_iter()
            .filter(|s| str_field(s, "name").starts_with(&prefix))
            .map(|s| {
                // Function or Variable
                let kind = if s["kind"] == 12 { 3 } else { 6 };
                json!({
                    "label": str_field(&s, "name"),
                    "kind": kind,
                    "detail": format!("{} symbol", doc.language_id),
                    "insertText": str_field(&s, "name"),
                })
            })
            .collect();

        json!({ "isIncomplete": false, "items": items })
    }

    fn signature_help(&self, params: &Value) -> Value {
        let Some((_, doc, word)) = self.word_at(params) else {
            return Value::Null;
        };
        let Some(line) = doc.text.lines().find(|l| l.contains(&format!("{word}("))) else {
            return Value::Null;
        };
        json!({
            "signatures": [{ "label": line.trim().trim_end_matches('{').trim(), "parameters": [] }],
            "activeSignature": 0,
            "activeParameter": 0
        })
    }

    fn definition(&self, params: &Value) -> Value {
        let Some((uri, doc, word)) = self.word_at(params) else {
            return Value::Null;
        };
        for symbol in extract_symbols(&doc.text) {
            if str_field(&symbol, "name") == word {
                return json!({ "uri": uri, "range": symbol["selectionRange"] });
            }
        }
        Value::Null
    }

    fn references(&self, params: &Value) -> Value {
        let Some((uri, doc, word)) = self.word_at(params) else {
            return json!([]);
        };
        Value::Array(
            occurrences(&doc.text, &word)
                .into_iter()
                .map(|(line, start)| location_json(uri, line, start, start + word.len()))
                .collect(),
        )
    }

    fn document_symbols(&self, params: &Value) -> Value {
        let uri = params
            .get("textDocument")
            .map(|td| str_field(td, "uri"))
            .unwrap_or_default();
        self.documents
            .get(uri)
            .map_or(Value::Null, |doc| Value::Array(extract_symbols(&doc.text)))
    }

    fn workspace_symbols(&self, params: &Value) -> Value {
        let query = str_field(params, "query");
        let mut uris: Vec<&String> = self.documents.keys().collect();
        uris.sort();

        let mut found = Vec::new();
        for uri in uris {
            let Some(doc) = self.documents.get(uri) else {
                continue;
            };
            for symbol in extract_symbols(&doc.text) {
                let name = str_field(&symbol, "name");
                if query.is_empty() || name.contains(query) {
                    found.push(json!({
                        "name": name,
                        "kind": symbol["kind"],
                        "location": { "uri": uri, "range": symbol["range"] }
                    }));
                }
            }
        }
        Value::Array(found)
    }

    fn formatting(&self, params: &Value) -> Value {
        let uri = params
            .get("textDocument")
            .map(|td| str_field(td, "uri"))
            .unwrap_or_default();
        let Some(doc) = self.documents.get(uri) else {
            return Value::Null;
        };

        let edits: Vec<Value> = doc
            .text
            .lines()
            .enumerate()
            .filter_map(|(line, text)| {
                let trimmed = text.trim_end().len();
                (trimmed < text.len()).then(|| {
                    json!({
                        "range": {
                            "start": { "line": line, "character": trimmed },
                            "end": { "line": line, "character": text.len() }
                        },
                        "newText": ""
                    })
                })
            })
            .collect();
        Value::Array(edits)
    }

    fn rename(&self, params: &Value) -> Value {
        let Some((uri, doc, word)) = self.word_at(params) else {
            return Value::Null;
        };
        let new_name = str_field(params, "newName");
        let edits: Vec<Value> = occurrences(&doc.text, &word)
            .into_iter()
            .map(|(line, start)| {
                json!({
                    "range": {
                        "start": { "line": line, "character": start },
                        "end": { "line": line, "character": start + word.len() }
                    },
                    "newText": new_name
                })
            })
            .collect();
        json!({ "changes": { uri: edits } })
    }

    fn publish_diagnostics(&self, uri: &str) {
        if self.args.no_diagnostics {
            return;
        }
        let version = self.documents.get(uri).map_or(0, |d| d.version);
        let message = json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": uri,
                "diagnostics": [{
                    "range": {
                        "start": { "line": 0, "character": 0 },
                        "end": { "line": 0, "character": 1 }
                    },
                    "severity": 2,
                    "source": "mockls",
                    "message": format!("mockls: version {version}")
                }]
            }
        });

        let delay = self.args.diagnostics_delay;
        let split = self.args.split_writes;
        if delay > 0 {
            let writer = self.writer.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(delay));
                send_message(&writer, split, &message);
            });
        } else {
            send_message(&self.writer, split, &message);
        }
    }

    fn send_request(&self, method: &str, params: &Value) {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        send_message(
            &self.writer,
            self.args.split_writes,
            &json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        );
    }

    fn send_response(&mut self, response: &Response) {
        let Ok(body) = serde_json::to_string(response) else {
            return;
        };
        write_framed(&self.writer, self.args.split_writes, &body);

        self.response_count += 1;
        if let Some(max) = self.args.drop_after
            && self.response_count >= max
        {
            std::process::exit(1);
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "textDocumentSync": { "openClose": true, "change": 1, "save": { "includeText": true } },
            "hoverProvider": true,
            "completionProvider": { "triggerCharacters": [".", ":"] },
            "signatureHelpProvider": { "triggerCharacters": ["("] },
            "definitionProvider": true,
            "referencesProvider": true,
            "documentSymbolProvider": true,
            "workspaceSymbolProvider": true,
            "codeActionProvider": true,
            "documentFormattingProvider": true,
            "renameProvider": true
        },
        "serverInfo": { "name": "mockls", "version": env!("CARGO_PKG_VERSION") }
    })
}

fn code_actions(params: &Value) -> Value {
    let uri = params
        .get("textDocument")
        .map(|td| str_field(td, "uri"))
        .unwrap_or_default();
    json!([{
        "title": "mockls: organize includes",
        "command": "mockls.organize",
        "arguments": [uri]
    }])
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn eprintln_banner(banner: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{banner}");
    let _ = stderr.flush();
}

/// Extract `(uri, line, col)` from a text document position.
fn extract_position(params: &Value) -> Option<(&str, usize, usize)> {
    let uri = params.get("textDocument")?.get("uri")?.as_str()?;
    let position = params.get("position")?;
    let line = usize::try_from(position.get("line")?.as_u64()?).ok()?;
    let col = usize::try_from(position.get("character")?.as_u64()?).ok()?;
    Some((uri, line, col))
}

fn location_json(uri: &str, line: usize, start: usize, end: usize) -> Value {
    json!({
        "uri": uri,
        "range": {
            "start": { "line": line, "character": start },
            "end": { "line": line, "character": end }
        }
    })
}

/// Writes one framed message, optionally in small flushed pieces.
fn write_framed(writer: &Writer, split: bool, body: &str) {
    let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
    let Ok(mut w) = writer.lock() else { return };
    if split {
        for piece in frame.as_bytes().chunks(7) {
            let _ = w.write_all(piece);
            let _ = w.flush();
        }
    } else {
        let _ = w.write_all(frame.as_bytes());
        let _ = w.flush();
    }
}

fn send_message(writer: &Writer, split: bool, value: &Value) {
    if let Ok(body) = serde_json::to_string(value) {
        write_framed(writer, split, &body);
    }
}

/// Parses one framed message. Returns the body and the bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let content_length: usize = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())
            .flatten()
    })?;

    let total = header_end + 4 + content_length;
    if buffer.len() < total {
        return None;
    }
    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}

/// The identifier touching `col` on `line`.
fn extract_word(content: &str, line: usize, col: usize) -> Option<String> {
    let bytes = content.lines().nth(line)?.as_bytes();
    if col >= bytes.len() || !is_word_char(bytes[col]) {
        return None;
    }
    let start = (0..col)
        .rev()
        .find(|&i| !is_word_char(bytes[i]))
        .map_or(0, |i| i + 1);
    let end = (col..bytes.len())
        .find(|&i| !is_word_char(bytes[i]))
        .unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[start..end]).ok().map(str::to_string)
}

/// The identifier characters immediately before `col` on `line`.
fn word_prefix(content: &str, line: usize, col: usize) -> String {
    let Some(bytes) = content.lines().nth(line).map(str::as_bytes) else {
        return String::new();
    };
    let end = col.min(bytes.len());
    let start = (0..end)
        .rev()
        .find(|&i| !is_word_char(bytes[i]))
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[start..end]).into_owned()
}

const fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Whole-word occurrences of `word` as `(line, column)`.
fn occurrences(content: &str, word: &str) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    for (line_idx, line) in content.lines().enumerate() {
        let bytes = line.as_bytes();
        let mut from = 0;
        while let Some(pos) = line[from..].find(word) {
            let start = from + pos;
            let end = start + word.len();
            let before = start == 0 || !is_word_char(bytes[start - 1]);
            let after = end >= bytes.len() || !is_word_char(bytes[end]);
            if before && after {
                found.push((line_idx, start));
            }
            from = end;
        }
    }
    found
}

const MODIFIERS: &[&str] = &[
    "public ", "private ", "protected ", "static ", "final ", "abstract ", "inline ", "virtual ",
    "const ",
];

/// `(keyword, symbol kind)` for declarations the mock recognizes. Type
/// keywords become functions when followed by `(`, variables otherwise.
const DECLARATIONS: &[(&str, u8)] = &[
    ("class ", 5),
    ("struct ", 23),
    ("interface ", 11),
    ("enum ", 10),
    ("namespace ", 3),
    ("void ", 12),
    ("int ", 13),
    ("bool ", 13),
    ("double ", 13),
    ("auto ", 13),
    ("String ", 13),
];

/// Flat `DocumentSymbol`s for simple C++ and Java declarations.
fn extract_symbols(content: &str) -> Vec<Value> {
    let mut symbols = Vec::new();

    for (line_idx, line_text) in content.lines().enumerate() {
        let mut rest = line_text.trim_start();
        while let Some(modifier) = MODIFIERS.iter().find(|m| rest.starts_with(**m)) {
            rest = rest[modifier.len()..].trim_start();
        }

        let Some((keyword, kind)) = DECLARATIONS.iter().find(|(k, _)| rest.starts_with(*k)) else {
            continue;
        };
        let after = &rest[keyword.len()..];
        let name: String = after
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            continue;
        }

        let is_call = after[name.len()..].trim_start().starts_with('(');
        let kind = if *kind == 13 && is_call { 12 } else { *kind };
        let col_start = line_text.len() - after.len();
        let indent = line_text.len() - line_text.trim_start().len();

        symbols.push(json!({
            "name": name,
            "kind": kind,
            "range": {
                "start": { "line": line_idx, "character": indent },
                "end": { "line": line_idx, "character": line_text.len() }
            },
            "selectionRange": {
                "start": { "line": line_idx, "character": col_start },
                "end": { "line": line_idx, "character": col_start + name.len() }
            }
        }));
    }

    symbols
}

fn main() {
    let args = Args::parse();
    let mut server = MockServer::new(args, stdout_writer());
    let mut stdin = std::io::stdin().lock();
    server.run(&mut stdin);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_args() -> Args {
        Args::parse_from(["mockls"])
    }

    fn frame(value: &Value) -> Vec<u8> {
        let body = value.to_string();
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    fn run(args: Args, messages: &[Value]) -> Vec<Value> {
        let input: Vec<u8> = messages.iter().flat_map(frame).collect();
        let (writer, buf) = buffer_writer();
        let mut server = MockServer::new(args, writer);
        server.run(&mut Cursor::new(input));

        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let mut rest = data.as_slice();
        let mut out = Vec::new();
        while let Some((body, consumed)) = try_parse_message(rest) {
            out.push(serde_json::from_str(&body).unwrap());
            rest = &rest[consumed..];
        }
        out
    }

    fn request(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn open(uri: &str, text: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": { "uri": uri, "languageId": "cpp", "version": 1, "text": text }
            }
        })
    }

    fn at(uri: &str, line: u32, character: u32) -> Value {
        json!({
            "textDocument": { "uri": uri },
            "position": { "line": line, "character": character }
        })
    }

    fn response(messages: &[Value], id: u64) -> &Value {
        messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(id) && m.get("method").is_none())
            .expect("response")
    }

    const URI: &str = "file:///ws/main.cpp";
    const TEXT: &str = "class Widget {};\nint compute(int x) {\n  return x;\n}\nint main() { return compute(1); }\n";

    #[test]
    fn test_initialize_advertises_capabilities() {
        let messages = run(default_args(), &[request(1, "initialize", json!({}))]);
        let caps = &response(&messages, 1)["result"]["capabilities"];
        assert_eq!(caps["hoverProvider"], true);
        assert!(caps["completionProvider"].is_object());
        assert_eq!(caps["renameProvider"], true);
    }

    #[test]
    fn test_hover_and_definition() {
        let messages = run(
            default_args(),
            &[
                request(1, "initialize", json!({})),
                open(URI, TEXT),
                request(2, "textDocument/hover", at(URI, 4, 21)),
                request(3, "textDocument/definition", at(URI, 4, 21)),
            ],
        );
        let hover = &response(&messages, 2)["result"]["contents"]["value"];
        assert!(hover.as_str().unwrap().contains("compute"));
        let def = &response(&messages, 3)["result"];
        assert_eq!(def["range"]["start"]["line"], 1);
        assert_eq!(def["range"]["start"]["character"], 4);
    }

    #[test]
    fn test_completion_filters_by_prefix() {
        let text = format!("{TEXT}co");
        let messages = run(
            default_args(),
            &[
                request(1, "initialize", json!({})),
                open(URI, &text),
                request(2, "textDocument/completion", at(URI, 5, 2)),
            ],
        );
        let items = response(&messages, 2)["result"]["items"].as_array().unwrap().clone();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["label"], "compute");
    }

    #[test]
    fn test_symbols_recognize_declarations() {
        let names: Vec<String> = extract_symbols(TEXT)
            .iter()
            .map(|s| str_field(s, "name").to_string())
            .collect();
        assert_eq!(names, vec!["Widget", "compute", "main"]);

        let java = extract_symbols("public class App {\n  private static void run() {}\n}\n");
        assert_eq!(java[0]["kind"], 5);
        assert_eq!(java[1]["name"], "run");
        assert_eq!(java[1]["kind"], 12);
    }

    #[test]
    fn test_rename_edits_whole_words() {
        let messages = run(
            default_args(),
            &[
                request(1, "initialize", json!({})),
                open(URI, TEXT),
                request(
                    2,
                    "textDocument/rename",
                    json!({
                        "textDocument": { "uri": URI },
                        "position": { "line": 1, "character": 5 },
                        "newName": "calc"
                    }),
                ),
            ],
        );
        let edits = response(&messages, 2)["result"]["changes"][URI].as_array().unwrap().clone();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0]["newText"], "calc");
    }

    #[test]
    fn test_diagnostics_report_version() {
        let change = json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didChange",
            "params": {
                "textDocument": { "uri": URI, "version": 3 },
                "contentChanges": [{ "text": "int y;" }]
            }
        });
        let messages = run(default_args(), &[open(URI, TEXT), change]);
        let published: Vec<&Value> = messages
            .iter()
            .filter(|m| m["method"] == "textDocument/publishDiagnostics")
            .collect();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1]["params"]["diagnostics"][0]["message"], "mockls: version 3");
    }

    #[test]
    fn test_fail_and_unknown_methods() {
        let mut args = default_args();
        args.fail_on = vec!["textDocument/hover".to_string()];
        let messages = run(
            args,
            &[
                request(1, "textDocument/hover", at(URI, 0, 0)),
                request(2, "textDocument/typeHierarchy", json!({})),
            ],
        );
        assert_eq!(response(&messages, 1)["error"]["code"], -32603);
        assert_eq!(response(&messages, 2)["error"]["code"], -32601);
    }

    #[test]
    fn test_configuration_request_follows_initialize() {
        let mut args = default_args();
        args.send_configuration_request = true;
        args.split_writes = true;
        let messages = run(args, &[request(7, "initialize", json!({}))]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["method"], "workspace/configuration");
        assert_eq!(messages[1]["params"]["items"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_word_helpers() {
        assert_eq!(extract_word("int compute(int x)", 0, 6).as_deref(), Some("compute"));
        assert_eq!(extract_word("a + b", 0, 1), None);
        assert_eq!(word_prefix("  return com", 0, 12), "com");
        assert_eq!(occurrences("x xx x", "x"), vec![(0, 0), (0, 5)]);
    }
}
