// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Open document tracking and `file://` URI handling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::ClientError;

/// Result of recording an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChange {
    /// The document was not open and has been registered at version 1.
    Opened,
    /// The document advanced to the contained version.
    Changed(i32),
}

/// Version numbers of the documents open on one connection.
///
/// Versions start at 1 and only increase until the document is closed.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    versions: HashMap<String, i32>,
}

impl DocumentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `uri` at version 1. Returns `false` if it was already open,
    /// in which case nothing changes.
    pub fn open(&mut self, uri: &str) -> bool {
        if self.versions.contains_key(uri) {
            return false;
        }
        self.versions.insert(uri.to_string(), 1);
        true
    }

    /// Advances the version of `uri`.
    ///
    /// Without an explicit version the document moves to `previous + 1`. A
    /// document that is not open is registered at version 1 instead.
    ///
    /// # Errors
    ///
    /// As for [`Self::next_change`].
    pub fn update(&mut self, uri: &str, explicit: Option<i32>) -> Result<DocumentChange, ClientError> {
        let change = self.next_change(uri, explicit)?;
        self.commit(uri, change);
        Ok(change)
    }

    /// The change an update of `uri` would make, without recording it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::StaleVersion`] if `explicit` does not exceed
    /// the current version, or [`ClientError::VersionOverflow`] if the
    /// version cannot advance further.
    pub fn next_change(&self, uri: &str, explicit: Option<i32>) -> Result<DocumentChange, ClientError> {
        let Some(&current) = self.versions.get(uri) else {
            return Ok(DocumentChange::Opened);
        };

        let next = match explicit {
            Some(requested) if requested <= current => {
                return Err(ClientError::StaleVersion {
                    uri: uri.to_string(),
                    current,
                    requested,
                });
            }
            Some(requested) => requested,
            None => current
                .checked_add(1)
                .ok_or_else(|| ClientError::VersionOverflow(uri.to_string()))?,
        };
        Ok(DocumentChange::Changed(next))
    }

    /// Records a change computed by [`Self::next_change`].
    pub fn commit(&mut self, uri: &str, change: DocumentChange) {
        let version = match change {
            DocumentChange::Opened => 1,
            DocumentChange::Changed(version) => version,
        };
        self.versions.insert(uri.to_string(), version);
    }

    /// Unregisters `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DocumentNotOpen`] if it was not registered.
    pub fn close(&mut self, uri: &str) -> Result<(), ClientError> {
        self.versions
            .remove(uri)
            .map(|_| ())
            .ok_or_else(|| ClientError::DocumentNotOpen(uri.to_string()))
    }

    /// Current version of `uri`, if open.
    #[must_use]
    pub fn version(&self, uri: &str) -> Option<i32> {
        self.versions.get(uri).copied()
    }

    /// Whether `uri` is open.
    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        self.versions.contains_key(uri)
    }

    /// Number of open documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no documents are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// URIs of all open documents, sorted.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.versions.keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Forgets every document.
    pub fn clear(&mut self) {
        self.versions.clear();
    }
}

/// Canonical `file://` URI for a path.
///
/// Existing paths are canonicalized so symlinked spellings share one
/// registry entry. Missing paths are made absolute without touching the
/// filesystem.
///
/// # Errors
///
/// Returns [`ClientError::InvalidDocument`] if the path cannot be
/// represented as a file URI.
pub fn path_to_uri(path: &Path) -> Result<String, ClientError> {
    let absolute = path
        .canonicalize()
        .or_else(|_| std::path::absolute(path))
        .map_err(|e| ClientError::InvalidDocument(format!("{}: {e}", path.display())))?;

    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|()| ClientError::InvalidDocument(absolute.display().to_string()))
}

/// Normalizes a document location given either as a `file://` URI or as a
/// filesystem path.
///
/// # Errors
///
/// Returns [`ClientError::InvalidDocument`] for unparsable URIs, non-file
/// schemes, and paths that cannot become file URIs.
pub fn document_uri(location: &str) -> Result<String, ClientError> {
    if location.contains("://") {
        let url = Url::parse(location)
            .map_err(|e| ClientError::InvalidDocument(format!("{location}: {e}")))?;
        if url.scheme() != "file" {
            return Err(ClientError::InvalidDocument(format!(
                "{location}: only file URIs are supported"
            )));
        }
        return Ok(url.into());
    }
    path_to_uri(Path::new(location))
}

/// Filesystem path of a `file://` URI.
#[must_use]
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_update_update_reaches_three() -> anyhow::Result<()> {
        let mut registry = DocumentRegistry::new();
        assert!(registry.open("file:///a.cpp"));
        assert_eq!(registry.update("file:///a.cpp", None)?, DocumentChange::Changed(2));
        assert_eq!(registry.update("file:///a.cpp", None)?, DocumentChange::Changed(3));
        assert_eq!(registry.version("file:///a.cpp"), Some(3));
        Ok(())
    }

    #[test]
    fn test_reopen_is_noop() {
        let mut registry = DocumentRegistry::new();
        assert!(registry.open("file:///a.cpp"));
        assert!(registry
            .update("file:///a.cpp", None)
            .is_ok_and(|c| c == DocumentChange::Changed(2)));
        assert!(!registry.open("file:///a.cpp"));
        assert_eq!(registry.version("file:///a.cpp"), Some(2));
    }

    #[test]
    fn test_update_past_max_version_fails() -> anyhow::Result<()> {
        let mut registry = DocumentRegistry::new();
        registry.open("file:///a.cpp");
        assert_eq!(
            registry.update("file:///a.cpp", Some(i32::MAX))?,
            DocumentChange::Changed(i32::MAX)
        );
        assert!(matches!(
            registry.update("file:///a.cpp", None),
            Err(ClientError::VersionOverflow(uri)) if uri == "file:///a.cpp"
        ));
        assert_eq!(registry.version("file:///a.cpp"), Some(i32::MAX));
        Ok(())
    }

    #[test]
    fn test_next_change_does_not_record() -> anyhow::Result<()> {
        let mut registry = DocumentRegistry::new();
        assert_eq!(registry.next_change("file:///a.cpp", None)?, DocumentChange::Opened);
        assert!(!registry.is_open("file:///a.cpp"));

        registry.commit("file:///a.cpp", DocumentChange::Opened);
        assert_eq!(registry.next_change("file:///a.cpp", None)?, DocumentChange::Changed(2));
        assert_eq!(registry.version("file:///a.cpp"), Some(1));
        Ok(())
    }

    #[test]
    fn test_update_unknown_is_implicit_open() -> anyhow::Result<()> {
        let mut registry = DocumentRegistry::new();
        assert_eq!(registry.update("file:///b.java", Some(7))?, DocumentChange::Opened);
        assert_eq!(registry.version("file:///b.java"), Some(1));
        Ok(())
    }

    #[test]
    fn test_explicit_version_must_advance() -> anyhow::Result<()> {
        let mut registry = DocumentRegistry::new();
        registry.open("file:///a.cpp");
        assert_eq!(registry.update("file:///a.cpp", Some(10))?, DocumentChange::Changed(10));

        let err = registry.update("file:///a.cpp", Some(10));
        assert!(matches!(
            err,
            Err(ClientError::StaleVersion { current: 10, requested: 10, .. })
        ));
        assert_eq!(registry.version("file:///a.cpp"), Some(10));
        Ok(())
    }

    #[test]
    fn test_close_then_reopen_resets_version() -> anyhow::Result<()> {
        let mut registry = DocumentRegistry::new();
        registry.open("file:///a.cpp");
        registry.update("file:///a.cpp", None)?;
        registry.close("file:///a.cpp")?;
        assert!(!registry.is_open("file:///a.cpp"));

        registry.open("file:///a.cpp");
        assert_eq!(registry.version("file:///a.cpp"), Some(1));
        Ok(())
    }

    #[test]
    fn test_close_unknown_fails() {
        let mut registry = DocumentRegistry::new();
        assert!(matches!(
            registry.close("file:///nope.cpp"),
            Err(ClientError::DocumentNotOpen(uri)) if uri == "file:///nope.cpp"
        ));
    }

    #[test]
    fn test_path_to_uri_canonicalizes_existing_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("main.cpp");
        std::fs::write(&file, "int main() {}")?;

        let dotted = dir.path().join(".").join("main.cpp");
        let uri = path_to_uri(&dotted)?;
        assert_eq!(uri, path_to_uri(&file.canonicalize()?)?);
        assert!(uri.starts_with("file:///"));
        assert!(uri.ends_with("/main.cpp"));
        Ok(())
    }

    #[test]
    fn test_path_to_uri_percent_encodes() -> anyhow::Result<()> {
        let uri = path_to_uri(Path::new("/tmp/does not exist/a b.cpp"))?;
        assert_eq!(uri, "file:///tmp/does%20not%20exist/a%20b.cpp");
        Ok(())
    }

    #[test]
    fn test_document_uri_accepts_uris_and_paths() -> anyhow::Result<()> {
        assert_eq!(document_uri("file:///a.cpp")?, "file:///a.cpp");
        assert_eq!(document_uri("/tmp/missing/x.java")?, "file:///tmp/missing/x.java");
        assert!(matches!(
            document_uri("https://example.com/a.cpp"),
            Err(ClientError::InvalidDocument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_uri_to_path() {
        assert_eq!(
            uri_to_path("file:///tmp/a%20b.cpp"),
            Some(PathBuf::from("/tmp/a b.cpp"))
        );
        assert_eq!(uri_to_path("not a uri"), None);
    }
}
