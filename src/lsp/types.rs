// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Consumer-facing shapes decoded from server responses.
//!
//! Positions, ranges, locations, diagnostics and edits are passed through as
//! [`lsp_types`] values. Only completion items and hover contents are
//! flattened into simpler records.

use lsp_types::{
    CompletionItem, CompletionItemKind, CompletionResponse, Documentation, GotoDefinitionResponse,
    Hover, HoverContents, Location, LocationLink, MarkedString, Position, Range,
};
use serde::Serialize;
use serde_json::Value;

/// Severity of a log line delivered to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `MessageType.Error`.
    Error,
    /// `MessageType.Warning`.
    Warning,
    /// `MessageType.Info`.
    Info,
    /// `MessageType.Log`, and anything unrecognized.
    Log,
    /// A line the server wrote to stderr.
    Stderr,
}

impl LogLevel {
    /// Maps the numeric `type` of `window/logMessage` and
    /// `window/showMessage`.
    #[must_use]
    pub const fn from_message_type(kind: i64) -> Self {
        match kind {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }
}

/// What a request was about, recorded so its response can be delivered with
/// the caller's own coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Sent without correlation data.
    None,
    /// A whole document.
    Document {
        /// Document URI.
        uri: String,
    },
    /// A cursor position in a document.
    Position {
        /// Document URI.
        uri: String,
        /// Zero-based position.
        position: Position,
    },
    /// A range in a document.
    Range {
        /// Document URI.
        uri: String,
        /// Zero-based range.
        range: Range,
    },
    /// A workspace-wide query string.
    Query(String),
}

/// One completion candidate, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionEntry {
    /// Text shown in the completion list.
    pub label: String,
    /// Symbol kind, when the server supplied one.
    pub kind: Option<CompletionItemKind>,
    /// One-line detail such as a signature.
    pub detail: Option<String>,
    /// Documentation as plain text or markdown source.
    pub documentation: Option<String>,
    /// Text to insert. Falls back to the label.
    pub insert_text: String,
    /// Text used for filtering, when it differs from the label.
    pub filter_text: Option<String>,
}

impl From<CompletionItem> for CompletionEntry {
    fn from(item: CompletionItem) -> Self {
        let documentation = item.documentation.map(|doc| match doc {
            Documentation::String(text) => text,
            Documentation::MarkupContent(markup) => markup.value,
        });
        let insert_text = item.insert_text.unwrap_or_else(|| item.label.clone());

        Self {
            label: item.label,
            kind: item.kind,
            detail: item.detail,
            documentation,
            insert_text,
            filter_text: item.filter_text,
        }
    }
}

/// Decodes a `textDocument/completion` result.
///
/// Returns the entries and whether the list is incomplete. A `null` result
/// is an empty, complete list. A list without `isIncomplete` is complete.
///
/// # Errors
///
/// Returns an error if the result is neither an item array nor a
/// completion list.
pub fn decode_completion(mut result: Value) -> Result<(Vec<CompletionEntry>, bool), serde_json::Error> {
    if result.is_null() {
        return Ok((Vec::new(), false));
    }
    if let Some(list) = result.as_object_mut()
        && let Some(items) = list.remove("items")
    {
        let incomplete = list
            .get("isIncomplete")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let items: Vec<CompletionItem> = serde_json::from_value(items)?;
        return Ok((items.into_iter().map(CompletionEntry::from).collect(), incomplete));
    }
    let (items, incomplete) = match serde_json::from_value::<CompletionResponse>(result)? {
        CompletionResponse::Array(items) => (items, false),
        CompletionResponse::List(list) => (list.items, list.is_incomplete),
    };
    Ok((items.into_iter().map(CompletionEntry::from).collect(), incomplete))
}

/// Decodes a `textDocument/hover` result into display text.
///
/// A `null` result yields an empty string.
///
/// # Errors
///
/// Returns an error if the result is not a hover object.
pub fn decode_hover(result: Value) -> Result<String, serde_json::Error> {
    if result.is_null() {
        return Ok(String::new());
    }
    let hover: Hover = serde_json::from_value(result)?;
    Ok(hover_text(hover.contents))
}

/// Flattens hover contents: a plain string, a markup value, or an array of
/// either joined with newlines.
#[must_use]
pub fn hover_text(contents: HoverContents) -> String {
    fn marked(s: MarkedString) -> String {
        match s {
            MarkedString::String(text) => text,
            MarkedString::LanguageString(ls) => ls.value,
        }
    }

    match contents {
        HoverContents::Scalar(s) => marked(s),
        HoverContents::Array(items) => items.into_iter().map(marked).collect::<Vec<_>>().join("\n"),
        HoverContents::Markup(markup) => markup.value,
    }
}

/// Decodes a definition-style result (`Location`, `Location[]` or
/// `LocationLink[]`) into plain locations. `null` yields none.
///
/// # Errors
///
/// Returns an error if the result has none of the accepted shapes.
pub fn decode_locations(result: Value) -> Result<Vec<Location>, serde_json::Error> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_value::<GotoDefinitionResponse>(result)? {
        GotoDefinitionResponse::Scalar(location) => vec![location],
        GotoDefinitionResponse::Array(locations) => locations,
        GotoDefinitionResponse::Link(links) => links.into_iter().map(link_target).collect(),
    })
}

fn link_target(link: LocationLink) -> Location {
    Location {
        uri: link.target_uri,
        range: link.target_selection_range,
    }
}

/// Decodes a result that is either `null` or a JSON array of `T`.
///
/// # Errors
///
/// Returns an error if the array elements do not match `T`.
pub fn decode_list<T: serde::de::DeserializeOwned>(
    result: Value,
) -> Result<Vec<T>, serde_json::Error> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_list_and_array() -> anyhow::Result<()> {
        let (entries, incomplete) = decode_completion(json!({
            "isIncomplete": true,
            "items": [
                { "label": "push_back", "kind": 2, "detail": "void push_back(T)" },
                { "label": "size", "insertText": "size()", "documentation": "Number of elements" }
            ]
        }))?;
        assert!(incomplete);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].insert_text, "push_back");
        assert_eq!(entries[0].kind, Some(CompletionItemKind::METHOD));
        assert_eq!(entries[1].insert_text, "size()");
        assert_eq!(entries[1].documentation.as_deref(), Some("Number of elements"));

        let (entries, incomplete) = decode_completion(json!([{ "label": "x" }]))?;
        assert!(!incomplete);
        assert_eq!(entries[0].label, "x");
        Ok(())
    }

    #[test]
    fn test_completion_list_without_incomplete_flag() -> anyhow::Result<()> {
        assert_eq!(decode_completion(json!({ "items": [] }))?, (Vec::new(), false));

        let (entries, incomplete) = decode_completion(json!({ "items": [{ "label": "at" }] }))?;
        assert!(!incomplete);
        assert_eq!(entries[0].label, "at");

        assert!(decode_completion(json!({ "items": [{ "kind": 2 }] })).is_err());
        Ok(())
    }

    #[test]
    fn test_completion_null_is_empty() -> anyhow::Result<()> {
        assert_eq!(decode_completion(Value::Null)?, (Vec::new(), false));
        Ok(())
    }

    #[test]
    fn test_completion_markup_documentation() -> anyhow::Result<()> {
        let (entries, _) = decode_completion(json!({
            "isIncomplete": false,
            "items": [{
                "label": "println",
                "documentation": { "kind": "markdown", "value": "**Prints**" }
            }]
        }))?;
        assert_eq!(entries[0].documentation.as_deref(), Some("**Prints**"));
        Ok(())
    }

    #[test]
    fn test_hover_shapes() -> anyhow::Result<()> {
        assert_eq!(decode_hover(json!({ "contents": "int x" }))?, "int x");
        assert_eq!(
            decode_hover(json!({ "contents": { "kind": "markdown", "value": "`int x`" } }))?,
            "`int x`"
        );
        assert_eq!(
            decode_hover(json!({
                "contents": ["first", { "language": "cpp", "value": "int x;" }]
            }))?,
            "first\nint x;"
        );
        assert_eq!(decode_hover(Value::Null)?, "");
        Ok(())
    }

    #[test]
    fn test_locations_shapes() -> anyhow::Result<()> {
        let range = json!({ "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 3 } });

        let single = decode_locations(json!({ "uri": "file:///a.cpp", "range": range }))?;
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].uri.as_str(), "file:///a.cpp");

        let links = decode_locations(json!([{
            "targetUri": "file:///b.cpp",
            "targetRange": range,
            "targetSelectionRange": range
        }]))?;
        assert_eq!(links[0].uri.as_str(), "file:///b.cpp");
        assert_eq!(links[0].range.start.line, 1);

        assert!(decode_locations(Value::Null)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::from_message_type(1), LogLevel::Error);
        assert_eq!(LogLevel::from_message_type(2), LogLevel::Warning);
        assert_eq!(LogLevel::from_message_type(3), LogLevel::Info);
        assert_eq!(LogLevel::from_message_type(4), LogLevel::Log);
        assert_eq!(LogLevel::from_message_type(5), LogLevel::Log);
    }
}
