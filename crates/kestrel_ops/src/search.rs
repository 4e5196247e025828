//! Search execution: scoped scan, filter evaluation, limits.
//!
//! Size and time limits terminate the scan early with a distinguished
//! truncation outcome — a normal, non-fatal result, not a store error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use kestrel_common::config::{DereferencePolicy, SearchScope};
use kestrel_common::dn::Dn;
use kestrel_common::entry::Entry;
use kestrel_common::filter::Filter;
use kestrel_common::matching;
use kestrel_common::schema::SchemaProvider;
use kestrel_store::EntryStore;

/// One search request. Constructed per request, read-only during use.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: Filter,
    /// Maximum entries returned; 0 means unlimited.
    pub size_limit: usize,
    /// Wall-clock budget in milliseconds; 0 means unlimited.
    pub time_limit_ms: u64,
    /// Return attribute types without values.
    pub types_only: bool,
    /// Recorded for the alias-dereference collaborator; the core stores no
    /// aliases itself.
    pub deref: DereferencePolicy,
}

impl SearchRequest {
    pub fn new(base: Dn, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base,
            scope,
            filter,
            size_limit: 0,
            time_limit_ms: 0,
            types_only: false,
            deref: DereferencePolicy::default(),
        }
    }

    pub fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn with_time_limit_ms(mut self, limit: u64) -> Self {
        self.time_limit_ms = limit;
        self
    }

    pub fn types_only(mut self, on: bool) -> Self {
        self.types_only = on;
        self
    }
}

/// Why a search stopped before exhausting its candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationReason {
    SizeLimit,
    TimeLimit,
}

/// Whether the result set is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchOutcome {
    Complete,
    Truncated(TruncationReason),
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entries: Vec<Arc<Entry>>,
    pub outcome: SearchOutcome,
}

impl SearchResult {
    pub fn is_truncated(&self) -> bool {
        matches!(self.outcome, SearchOutcome::Truncated(_))
    }
}

/// Run a search against a point-in-time scan of the store.
pub(crate) fn run_search(
    store: &EntryStore,
    schema: &dyn SchemaProvider,
    request: &SearchRequest,
) -> SearchResult {
    let deadline = (request.time_limit_ms > 0)
        .then(|| Instant::now() + Duration::from_millis(request.time_limit_ms));

    let mut entries = Vec::new();
    let mut outcome = SearchOutcome::Complete;

    for candidate in store.scan(&request.base, request.scope) {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                outcome = SearchOutcome::Truncated(TruncationReason::TimeLimit);
                break;
            }
        }
        if !matching::matches(&request.filter, &candidate, schema) {
            continue;
        }
        if request.size_limit > 0 && entries.len() == request.size_limit {
            outcome = SearchOutcome::Truncated(TruncationReason::SizeLimit);
            break;
        }
        if request.types_only {
            entries.push(Arc::new(candidate.types_only_view()));
        } else {
            entries.push(candidate);
        }
    }

    SearchResult { entries, outcome }
}
