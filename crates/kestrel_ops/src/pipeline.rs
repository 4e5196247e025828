//! The operation pipeline: every mutation runs the same state machine,
//! `Received → Validated → Applied → Committed → Notified`.
//!
//! Hard guarantees:
//! - authorization is consulted before validation completes;
//! - a validation or apply failure aborts with zero store mutation and
//!   zero notification (fails clean);
//! - on commit success exactly one `ChangeNotification` per committed
//!   entry is dispatched synchronously on the committing thread *before*
//!   the operation returns, so a caller that observes the response also
//!   observes every listener's commit-visibility.
//!
//! Validation does advisory store reads; the commit primitives re-check
//! the same invariants atomically, so a race that invalidates the advisory
//! check surfaces as a commit-stage error, never as a partial mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_common::config::LimitsConfig;
use kestrel_common::dn::{Dn, Rdn};
use kestrel_common::entry::Entry;
use kestrel_common::error::{PipelineError, StoreError};
use kestrel_common::schema::{CoreSchema, SchemaProvider};
use kestrel_store::EntryStore;

use crate::dispatch::{ChangeDispatcher, ChangeKind, ChangeNotification};
use crate::modify::{apply_modifications, Modification};
use crate::search::{run_search, SearchRequest, SearchResult};

/// Pipeline stage reached by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationStage {
    Received,
    Validated,
    Applied,
    Committed,
    Notified,
}

impl std::fmt::Display for OperationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Applied => "applied",
            Self::Committed => "committed",
            Self::Notified => "notified",
        };
        f.write_str(s)
    }
}

/// What the pipeline does, for authorization purposes. Search is included:
/// reads are authorized like writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Delete,
    Modify,
    ModifyDn,
    Search,
}

/// Handed to the authorization collaborator before validation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub kind: OperationKind,
    pub target: Dn,
}

/// Allow/deny seam. The core implements no access-control policy.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, ctx: &OperationContext) -> Result<(), PipelineError>;
}

/// Default authorizer: everything is allowed.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _ctx: &OperationContext) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// A successfully committed and notified operation.
#[derive(Debug, Clone, Copy)]
pub struct CommittedOperation {
    /// Commit-order id of the (last) notification this operation produced.
    pub op_id: u64,
    /// Notifications dispatched; 1 except for subtree deletes.
    pub notifications: usize,
}

/// A failed operation, carrying the stage it failed in. Failures at or
/// before `Applied` are guaranteed to have left the store untouched.
#[derive(Debug)]
pub struct OperationFailure {
    pub stage: OperationStage,
    pub error: PipelineError,
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation failed at stage {}: {}", self.stage, self.error)
    }
}

impl std::error::Error for OperationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn fail(stage: OperationStage, error: impl Into<PipelineError>) -> OperationFailure {
    OperationFailure {
        stage,
        error: error.into(),
    }
}

pub struct OperationPipeline {
    store: Arc<EntryStore>,
    dispatcher: Arc<ChangeDispatcher>,
    authorizer: Arc<dyn Authorizer>,
    schema: Arc<dyn SchemaProvider>,
    limits: LimitsConfig,
    next_op_id: AtomicU64,
}

impl OperationPipeline {
    pub fn new(store: Arc<EntryStore>, dispatcher: Arc<ChangeDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            authorizer: Arc::new(AllowAll),
            schema: Arc::new(CoreSchema::new()),
            limits: LimitsConfig::default(),
            next_op_id: AtomicU64::new(1),
        }
    }

    /// Server-side default limits, applied to requests that leave a limit
    /// at 0 (unlimited).
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn SchemaProvider>) -> Self {
        self.schema = schema;
        self
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<ChangeDispatcher> {
        &self.dispatcher
    }

    // ── Operations ───────────────────────────────────────────────────

    pub fn add(&self, entry: Entry) -> Result<CommittedOperation, OperationFailure> {
        let target = entry.dn().clone();
        self.authorize(OperationKind::Add, &target)?;

        // Validated
        if target.is_root() {
            return Err(fail(
                OperationStage::Validated,
                PipelineError::SchemaViolation("cannot add the root DN".into()),
            ));
        }
        if self.store.exists(&target) {
            return Err(fail(
                OperationStage::Validated,
                StoreError::DuplicateEntry(target),
            ));
        }
        if target.depth() > 1 {
            let parent = target.parent().expect("depth > 1 has a parent");
            if !self.store.exists(&parent) {
                return Err(fail(OperationStage::Validated, StoreError::NoSuchParent(parent)));
            }
        }
        self.schema
            .validate_entry(&entry)
            .map_err(|e| fail(OperationStage::Validated, PipelineError::SchemaViolation(e)))?;

        // Applied is trivial for Add: the entry itself is the new state.
        // Committed — the store re-checks collision/parent atomically.
        let stored = self
            .store
            .put(entry)
            .map_err(|e| fail(OperationStage::Committed, e))?;

        // Notified
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let event =
            ChangeNotification::new(op_id, ChangeKind::Add, target, None, Some(stored));
        self.dispatcher.notify(&event);
        tracing::debug!(op_id, dn = %event.target_dn, "add committed");
        Ok(CommittedOperation {
            op_id,
            notifications: 1,
        })
    }

    /// Leaf-only delete, the directory default.
    pub fn delete(&self, dn: &Dn) -> Result<CommittedOperation, OperationFailure> {
        self.authorize(OperationKind::Delete, dn)?;

        // Validated (advisory; the store re-checks under its index lock).
        if !self.store.exists(dn) {
            return Err(fail(OperationStage::Validated, StoreError::NotFound(dn.clone())));
        }
        if self.store.has_children(dn) {
            return Err(fail(OperationStage::Validated, StoreError::NotLeaf(dn.clone())));
        }

        // Committed
        let removed = self
            .store
            .remove(dn)
            .map_err(|e| fail(OperationStage::Committed, e))?;

        // Notified
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let event =
            ChangeNotification::new(op_id, ChangeKind::Delete, dn.clone(), Some(removed), None);
        self.dispatcher.notify(&event);
        tracing::debug!(op_id, dn = %dn, "delete committed");
        Ok(CommittedOperation {
            op_id,
            notifications: 1,
        })
    }

    /// Explicitly requested recursive delete. Emits one Delete notification
    /// per removed entry, children first, so listeners replay a valid
    /// leaf-only sequence.
    pub fn delete_subtree(&self, dn: &Dn) -> Result<CommittedOperation, OperationFailure> {
        self.authorize(OperationKind::Delete, dn)?;

        if !self.store.exists(dn) {
            return Err(fail(OperationStage::Validated, StoreError::NotFound(dn.clone())));
        }

        let removed = self
            .store
            .remove_subtree(dn)
            .map_err(|e| fail(OperationStage::Committed, e))?;

        let mut last_id = 0;
        let count = removed.len();
        for entry in removed {
            last_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
            let event = ChangeNotification::new(
                last_id,
                ChangeKind::Delete,
                entry.dn().clone(),
                Some(entry),
                None,
            );
            self.dispatcher.notify(&event);
        }
        tracing::debug!(dn = %dn, entries = count, "subtree delete committed");
        Ok(CommittedOperation {
            op_id: last_id,
            notifications: count,
        })
    }

    pub fn modify(
        &self,
        dn: &Dn,
        mods: &[Modification],
    ) -> Result<CommittedOperation, OperationFailure> {
        self.authorize(OperationKind::Modify, dn)?;

        // Validated
        let snapshot = self
            .store
            .get(dn)
            .ok_or_else(|| fail(OperationStage::Validated, StoreError::NotFound(dn.clone())))?;

        // Applied: compute the new state without committing it.
        let next = apply_modifications(&snapshot, mods)
            .map_err(|e| fail(OperationStage::Applied, e))?;
        self.schema
            .validate_entry(&next)
            .map_err(|e| fail(OperationStage::Applied, PipelineError::SchemaViolation(e)))?;

        // Committed: CAS against the snapshot the apply step read.
        let (before, after) = self
            .store
            .replace_if(&snapshot, next)
            .map_err(|e| fail(OperationStage::Committed, e))?;

        // Notified
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let event = ChangeNotification::new(
            op_id,
            ChangeKind::Modify,
            dn.clone(),
            Some(before),
            Some(after),
        );
        self.dispatcher.notify(&event);
        tracing::debug!(op_id, dn = %dn, "modify committed");
        Ok(CommittedOperation {
            op_id,
            notifications: 1,
        })
    }

    pub fn modify_dn(
        &self,
        dn: &Dn,
        new_rdn: Rdn,
        new_superior: Option<&Dn>,
        delete_old_rdn: bool,
    ) -> Result<CommittedOperation, OperationFailure> {
        self.authorize(OperationKind::ModifyDn, dn)?;

        // Validated
        let snapshot = self
            .store
            .get(dn)
            .ok_or_else(|| fail(OperationStage::Validated, StoreError::NotFound(dn.clone())))?;
        let parent = match new_superior {
            Some(superior) => superior.clone(),
            None => dn.parent().unwrap_or_else(Dn::root),
        };
        let new_dn = parent.child(new_rdn.clone());
        if !parent.is_root() && !self.store.exists(&parent) {
            return Err(fail(OperationStage::Validated, StoreError::NoSuchParent(parent)));
        }
        if self.store.exists(&new_dn) {
            return Err(fail(
                OperationStage::Validated,
                StoreError::DuplicateEntry(new_dn),
            ));
        }

        // Applied: fold the RDN change into the attribute state.
        let mut adjusted = (*snapshot).clone();
        if delete_old_rdn {
            if let Some(old_rdn) = dn.rdn() {
                for ava in old_rdn.avas() {
                    adjusted.remove_value(ava.attr(), ava.value());
                }
            }
        }
        for ava in new_rdn.avas() {
            // Already-present values are fine; the RDN must be represented.
            let _ = adjusted.add_value(ava.attr(), ava.value());
        }
        self.schema
            .validate_entry(&adjusted)
            .map_err(|e| fail(OperationStage::Applied, PipelineError::SchemaViolation(e)))?;

        // Committed: the store re-validates collision/parent atomically.
        let (before, after) = self
            .store
            .rename(dn, &new_dn, Some(adjusted))
            .map_err(|e| fail(OperationStage::Committed, e))?;

        // Notified
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let event = ChangeNotification::new(
            op_id,
            ChangeKind::ModifyDn,
            dn.clone(),
            Some(before),
            Some(after),
        );
        self.dispatcher.notify(&event);
        tracing::debug!(op_id, from = %dn, to = %event.after.as_ref().expect("after set").dn(), "modifydn committed");
        Ok(CommittedOperation {
            op_id,
            notifications: 1,
        })
    }

    /// Read-side search. Limit hits are a normal truncated outcome, not a
    /// failure.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResult, OperationFailure> {
        self.authorize(OperationKind::Search, &request.base)?;
        let mut effective = request.clone();
        if effective.size_limit == 0 {
            effective.size_limit = self.limits.default_size_limit;
        }
        if effective.time_limit_ms == 0 {
            effective.time_limit_ms = self.limits.default_time_limit_ms;
        }
        Ok(run_search(&self.store, self.schema.as_ref(), &effective))
    }

    fn authorize(&self, kind: OperationKind, target: &Dn) -> Result<(), OperationFailure> {
        let ctx = OperationContext {
            kind,
            target: target.clone(),
        };
        self.authorizer
            .authorize(&ctx)
            .map_err(|e| fail(OperationStage::Received, e))
    }
}
