// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Outstanding request bookkeeping.

use std::collections::HashMap;

use super::types::RequestOrigin;

/// A request awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Method the request was sent with. Selects the response decoder.
    pub method: String,
    /// Caller coordinates echoed back with the decoded result.
    pub origin: RequestOrigin,
}

/// Maps outstanding request ids to the request that produced them.
///
/// Ids come from a counter that only moves forward, so an id is never
/// reused for the lifetime of the ledger, even after [`RequestLedger::clear`].
#[derive(Debug)]
pub struct RequestLedger {
    next_id: i64,
    pending: HashMap<i64, PendingRequest>,
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }
}

impl RequestLedger {
    /// Creates an empty ledger whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next id and records the request under it.
    pub fn register(&mut self, method: impl Into<String>, origin: RequestOrigin) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingRequest {
                method: method.into(),
                origin,
            },
        );
        id
    }

    /// Removes and returns the entry for `id`.
    pub fn resolve(&mut self, id: i64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Looks up an entry without removing it.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Whether `id` is outstanding.
    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no requests are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Abandons every outstanding request. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// The id the next request will receive.
    #[must_use]
    pub const fn peek_next_id(&self) -> i64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_strictly_increasing() {
        let mut ledger = RequestLedger::new();
        let a = ledger.register("textDocument/hover", RequestOrigin::None);
        let b = ledger.register("textDocument/completion", RequestOrigin::None);
        let c = ledger.register("textDocument/hover", RequestOrigin::None);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_resolve_removes_exactly_once() {
        let mut ledger = RequestLedger::new();
        let id = ledger.register("shutdown", RequestOrigin::None);

        let entry = ledger.resolve(id);
        assert_eq!(entry.map(|e| e.method), Some("shutdown".to_string()));
        assert!(ledger.resolve(id).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_clear_does_not_reset_counter() {
        let mut ledger = RequestLedger::new();
        ledger.register("a", RequestOrigin::None);
        ledger.register("b", RequestOrigin::None);

        assert_eq!(ledger.clear(), 2);
        assert!(ledger.is_empty());
        assert_eq!(ledger.register("c", RequestOrigin::None), 3);
    }

    #[test]
    fn test_unknown_id_resolves_to_none() {
        let mut ledger = RequestLedger::new();
        ledger.register("a", RequestOrigin::None);
        assert!(ledger.resolve(99).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_origin_round_trips() {
        let mut ledger = RequestLedger::new();
        let origin = RequestOrigin::Document {
            uri: "file:///a.cpp".into(),
        };
        let id = ledger.register("textDocument/formatting", origin.clone());
        assert_eq!(ledger.get(id).map(|e| &e.origin), Some(&origin));
    }
}
