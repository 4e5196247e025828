//! The authoritative DN → entry mapping with a containment index.
//!
//! ## Layout
//! - `entries`: sharded map keyed by hierarchical key bytes — per-DN reads
//!   and in-place (non-structural) replaces touch only their shard.
//! - `index`: ordered set of the same keys. Because a descendant's key is
//!   strictly prefixed by its ancestors' keys, a subtree is one contiguous
//!   range and parents always sort before children. The write lock is held
//!   only for structural mutations (add / remove / rename); scans take the
//!   read lock.
//!
//! ## Concurrency contract
//! Entries are handed out as `Arc` snapshots — a reader never observes a
//! torn attribute set. Writers to unrelated DNs contend only on the index
//! lock, and only when the parent/child linkage itself changes. A scan is
//! point-in-time: it resolves its candidate keys under the read lock and is
//! not required to reflect commits that begin afterwards.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use kestrel_common::alert::{AlertCatalog, AlertRouter};
use kestrel_common::config::{SearchScope, StoreConfig};
use kestrel_common::dn::Dn;
use kestrel_common::entry::Entry;
use kestrel_common::error::StoreError;

use crate::backend::PersistenceBackend;
use crate::stats::{StoreStats, StoreStatsSnapshot};

type Key = Vec<u8>;

/// Component id used for alert registration and emission.
const COMPONENT_ID: &str = "entry-store";

/// Alert type raised when the persistence backend reports failures.
pub const ALERT_BACKEND_DEGRADED: &str = "backend-degraded";
/// Alert type raised when a bulk import finishes with orphaned entries.
pub const ALERT_IMPORT_ORPHANS: &str = "import-orphans";

pub struct EntryStore {
    entries: DashMap<Key, Arc<Entry>>,
    index: RwLock<BTreeMap<Key, Dn>>,
    /// Bumped on every structural change; scan order is stable within a
    /// fixed generation.
    generation: AtomicU64,
    bulk_import: AtomicBool,
    bulk_imported: AtomicU64,
    backend: Option<Arc<dyn PersistenceBackend>>,
    alerts: Option<Arc<AlertRouter>>,
    config: StoreConfig,
    stats: StoreStats,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl EntryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            index: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            bulk_import: AtomicBool::new(false),
            bulk_imported: AtomicU64::new(0),
            backend: None,
            alerts: None,
            config,
            stats: StoreStats::default(),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Attach an alert router. Declares this component's alert catalog.
    pub fn with_alerts(mut self, alerts: Arc<AlertRouter>) -> Self {
        alerts.register(
            COMPONENT_ID,
            AlertCatalog::new()
                .declare(
                    ALERT_BACKEND_DEGRADED,
                    "The persistence backend reported a write failure",
                )
                .declare(
                    ALERT_IMPORT_ORPHANS,
                    "A bulk import finished with orphaned entries",
                ),
        );
        self.alerts = Some(alerts);
        self
    }

    fn raise_alert(&self, alert_type: &str, message: &str) {
        if let Some(alerts) = &self.alerts {
            let _ = alerts.raise(COMPONENT_ID, alert_type, message);
        }
    }

    /// Rebuild store state from a backend's full range. Runs in bulk-import
    /// mode (parents may arrive after children) and finishes with the
    /// orphan post-pass.
    pub fn recover(
        config: StoreConfig,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Result<Self, StoreError> {
        let store = Self::new(config).with_backend(backend.clone());
        store.begin_bulk_import();
        for (key, value) in backend.range_scan(&[], &[0xFF])? {
            let entry: Entry = serde_json::from_slice(&value).map_err(|e| {
                StoreError::Persistence(format!("undecodable entry at key {key:02x?}: {e}"))
            })?;
            store.put(entry)?;
        }
        store.end_bulk_import()?;
        tracing::info!(entries = store.len(), "entry store recovered from backend");
        Ok(store)
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, dn: &Dn) -> Option<Arc<Entry>> {
        self.entries.get(&dn.hierarchical_key()).map(|e| e.clone())
    }

    pub fn exists(&self, dn: &Dn) -> bool {
        self.entries.contains_key(&dn.hierarchical_key())
    }

    pub fn has_children(&self, dn: &Dn) -> bool {
        let key = dn.hierarchical_key();
        let end = dn.subtree_key_end();
        self.index
            .read()
            .range((Excluded(key), Excluded(end)))
            .next()
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot(self.entries.len(), self.generation())
    }

    /// Entries within `scope` of `base`, in containment-index order
    /// (parents before children). The result is a point-in-time snapshot.
    pub fn scan(&self, base: &Dn, scope: SearchScope) -> Vec<Arc<Entry>> {
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        let key = base.hierarchical_key();
        let end = base.subtree_key_end();
        let base_depth = base.depth();

        let index = self.index.read();
        let mut out = Vec::new();
        match scope {
            SearchScope::Base => {
                if index.contains_key(&key) {
                    if let Some(entry) = self.entries.get(&key) {
                        out.push(entry.clone());
                    }
                }
            }
            SearchScope::OneLevel => {
                for (k, dn) in index.range((Excluded(key), Excluded(end))) {
                    if dn.depth() == base_depth + 1 {
                        if let Some(entry) = self.entries.get(k) {
                            out.push(entry.clone());
                        }
                    }
                }
            }
            SearchScope::WholeSubtree => {
                for (k, _) in index.range((Included(key), Excluded(end))) {
                    if let Some(entry) = self.entries.get(k) {
                        out.push(entry.clone());
                    }
                }
            }
            SearchScope::SubordinateSubtree => {
                for (k, _) in index.range((Excluded(key), Excluded(end))) {
                    if let Some(entry) = self.entries.get(k) {
                        out.push(entry.clone());
                    }
                }
            }
        }
        out
    }

    // ── Structural writes ────────────────────────────────────────────

    /// Insert a new entry. The parent must already exist unless the entry
    /// sits directly under the root or bulk-import mode is active.
    /// Returns the stored snapshot.
    pub fn put(&self, entry: Entry) -> Result<Arc<Entry>, StoreError> {
        let entry = Arc::new(entry);
        let key = entry.dn().hierarchical_key();
        let bulk = self.bulk_import.load(Ordering::Acquire);

        let mut index = self.index.write();
        if index.contains_key(&key) {
            return Err(StoreError::DuplicateEntry(entry.dn().clone()));
        }
        if !bulk && entry.dn().depth() > 1 {
            let parent = entry.dn().parent().expect("depth > 1 has a parent");
            if !index.contains_key(&parent.hierarchical_key()) {
                return Err(StoreError::NoSuchParent(parent));
            }
        }
        self.mirror_put(&key, &entry)?;
        index.insert(key.clone(), entry.dn().clone());
        // The shard insert stays under the index lock so a concurrent
        // structural op on this DN cannot observe index/entries out of sync.
        self.entries.insert(key, entry.clone());
        drop(index);

        self.generation.fetch_add(1, Ordering::Release);
        self.stats.adds.fetch_add(1, Ordering::Relaxed);

        if bulk {
            let n = self.bulk_imported.fetch_add(1, Ordering::Relaxed) + 1;
            let every = self.config.bulk_import_log_every;
            if every > 0 && n % every == 0 {
                tracing::info!(imported = n, "bulk import progress");
            }
        }
        Ok(entry)
    }

    /// Replace an existing entry in place (same DN, new attribute state).
    /// Non-structural: does not touch the containment index.
    /// Returns (previous, stored) snapshots.
    pub fn replace(&self, entry: Entry) -> Result<(Arc<Entry>, Arc<Entry>), StoreError> {
        let key = entry.dn().hierarchical_key();
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let entry = Arc::new(entry);
                self.mirror_put(&key, &entry)?;
                let previous = slot.insert(entry.clone());
                self.stats.replaces.fetch_add(1, Ordering::Relaxed);
                Ok((previous, entry))
            }
            dashmap::mapref::entry::Entry::Vacant(_) => {
                Err(StoreError::NotFound(entry.dn().clone()))
            }
        }
    }

    /// Compare-and-swap replace: succeeds only if the stored snapshot is
    /// still the one the caller's apply step was computed from. The lost
    /// side gets `ConcurrentModification` (retryable) — never a silent
    /// overwrite.
    pub fn replace_if(
        &self,
        expected: &Arc<Entry>,
        entry: Entry,
    ) -> Result<(Arc<Entry>, Arc<Entry>), StoreError> {
        let key = entry.dn().hierarchical_key();
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if !Arc::ptr_eq(slot.get(), expected) {
                    return Err(StoreError::ConcurrentModification(entry.dn().clone()));
                }
                let entry = Arc::new(entry);
                self.mirror_put(&key, &entry)?;
                let previous = slot.insert(entry.clone());
                self.stats.replaces.fetch_add(1, Ordering::Relaxed);
                Ok((previous, entry))
            }
            dashmap::mapref::entry::Entry::Vacant(_) => {
                Err(StoreError::NotFound(entry.dn().clone()))
            }
        }
    }

    /// Remove a leaf entry. Directory semantics are leaf-only delete; use
    /// [`EntryStore::remove_subtree`] for the explicitly requested
    /// recursive mode.
    pub fn remove(&self, dn: &Dn) -> Result<Arc<Entry>, StoreError> {
        let key = dn.hierarchical_key();
        let end = dn.subtree_key_end();

        let mut index = self.index.write();
        if !index.contains_key(&key) {
            return Err(StoreError::NotFound(dn.clone()));
        }
        if index
            .range((Excluded(key.clone()), Excluded(end)))
            .next()
            .is_some()
        {
            return Err(StoreError::NotLeaf(dn.clone()));
        }
        self.mirror_delete(&key)?;
        index.remove(&key);
        let removed = self
            .entries
            .remove(&key)
            .map(|(_, entry)| entry)
            .ok_or_else(|| StoreError::NotFound(dn.clone()))?;
        drop(index);

        self.generation.fetch_add(1, Ordering::Release);
        self.stats.removes.fetch_add(1, Ordering::Relaxed);
        Ok(removed)
    }

    /// Remove an entire subtree, children first. Gated by configuration;
    /// never the default delete path.
    pub fn remove_subtree(&self, dn: &Dn) -> Result<Vec<Arc<Entry>>, StoreError> {
        if !self.config.allow_recursive_delete {
            return Err(StoreError::RecursiveDeleteDisabled);
        }
        let key = dn.hierarchical_key();
        let end = dn.subtree_key_end();

        let mut index = self.index.write();
        if !index.contains_key(&key) {
            return Err(StoreError::NotFound(dn.clone()));
        }
        let doomed: Vec<Key> = index
            .range((Included(key), Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();

        // Children first, so a crash mid-way never leaves an orphan.
        let mut removed = Vec::with_capacity(doomed.len());
        for k in doomed.iter().rev() {
            self.mirror_delete(k)?;
            index.remove(k);
            if let Some((_, entry)) = self.entries.remove(k) {
                removed.push(entry);
            }
        }
        drop(index);

        self.generation.fetch_add(1, Ordering::Release);
        self.stats
            .removes
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Move an entry (and its subtree) to a new DN. Atomic with respect to
    /// concurrent structural changes: performed entirely under the index
    /// write lock. `base_replacement`, when given, supplies the moved base
    /// entry's attribute state (the ModifyDN RDN-value adjustments); its DN
    /// is overwritten with `new_dn`. Returns the base entry before and
    /// after the move.
    pub fn rename(
        &self,
        old_dn: &Dn,
        new_dn: &Dn,
        base_replacement: Option<Entry>,
    ) -> Result<(Arc<Entry>, Arc<Entry>), StoreError> {
        if old_dn.is_strict_ancestor_of(new_dn) {
            return Err(StoreError::RenameIntoOwnSubtree(old_dn.clone()));
        }
        let old_key = old_dn.hierarchical_key();
        let old_end = old_dn.subtree_key_end();
        let new_key = new_dn.hierarchical_key();

        let mut index = self.index.write();
        if !index.contains_key(&old_key) {
            return Err(StoreError::NotFound(old_dn.clone()));
        }
        if index.contains_key(&new_key) {
            return Err(StoreError::DuplicateEntry(new_dn.clone()));
        }
        if new_dn.depth() > 1 {
            let parent = new_dn.parent().expect("depth > 1 has a parent");
            if !index.contains_key(&parent.hierarchical_key()) {
                return Err(StoreError::NoSuchParent(parent));
            }
        }

        let moved: Vec<(Key, Dn)> = index
            .range((Included(old_key.clone()), Excluded(old_end)))
            .map(|(k, dn)| (k.clone(), dn.clone()))
            .collect();

        // Compute the full relocation before mutating anything.
        let mut base_replacement = base_replacement;
        let mut relocations = Vec::with_capacity(moved.len());
        for (k, dn) in &moved {
            let rebased = rebase(dn, old_dn, new_dn);
            let entry = self
                .entries
                .get(k)
                .map(|e| e.clone())
                .ok_or_else(|| StoreError::NotFound(dn.clone()))?;
            let new_entry = if *k == old_key {
                match base_replacement.take() {
                    Some(replacement) => Arc::new(replacement.with_dn(rebased.clone())),
                    None => Arc::new((*entry).clone().with_dn(rebased.clone())),
                }
            } else {
                Arc::new((*entry).clone().with_dn(rebased.clone()))
            };
            relocations.push((k.clone(), rebased.hierarchical_key(), rebased, entry, new_entry));
        }

        // Mirror to the backend: puts first, then deletes. The backend
        // contract only promises single-key atomicity, so a mid-way failure
        // is rolled back best-effort and surfaced.
        if let Some(backend) = &self.backend {
            let mut done = Vec::new();
            for (_, nk, _, _, ne) in &relocations {
                match backend.put(nk, &serialize(ne)?) {
                    Ok(()) => done.push(nk.clone()),
                    Err(e) => {
                        self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                        self.raise_alert(ALERT_BACKEND_DEGRADED, &e.to_string());
                        for k in &done {
                            if let Err(rb) = backend.delete(k) {
                                tracing::error!(error = %rb, "rename rollback failed");
                            }
                        }
                        return Err(e);
                    }
                }
            }
            for (ok, ..) in &relocations {
                backend.delete(ok)?;
            }
        }

        for (old_k, new_k, rebased, _, new_entry) in &relocations {
            index.remove(old_k);
            index.insert(new_k.clone(), rebased.clone());
            self.entries.remove(old_k);
            self.entries.insert(new_k.clone(), new_entry.clone());
        }
        drop(index);

        self.generation.fetch_add(1, Ordering::Release);
        self.stats.renames.fetch_add(1, Ordering::Relaxed);
        let (_, _, _, before, after) = relocations.into_iter().next().expect("base entry moved");
        Ok((before, after))
    }

    // ── Bulk import ──────────────────────────────────────────────────

    /// Suspend parent-existence checks for a bulk load. Referential
    /// integrity is re-established by [`EntryStore::end_bulk_import`].
    pub fn begin_bulk_import(&self) {
        self.bulk_imported.store(0, Ordering::Relaxed);
        self.bulk_import.store(true, Ordering::Release);
    }

    /// Leave bulk-import mode and run the deferred referential post-pass.
    pub fn end_bulk_import(&self) -> Result<(), StoreError> {
        self.bulk_import.store(false, Ordering::Release);
        let index = self.index.read();
        let mut orphans: Vec<&Dn> = Vec::new();
        for dn in index.values() {
            if dn.depth() > 1 {
                let parent = dn.parent().expect("depth > 1 has a parent");
                if !index.contains_key(&parent.hierarchical_key()) {
                    orphans.push(dn);
                }
            }
        }
        if let Some(first) = orphans.first() {
            for dn in orphans.iter().take(10) {
                tracing::warn!(dn = %dn, "bulk import: orphaned entry");
            }
            self.raise_alert(
                ALERT_IMPORT_ORPHANS,
                &format!("{} orphaned entries, first: {first}", orphans.len()),
            );
            return Err(StoreError::OrphanedEntries {
                count: orphans.len(),
                first: (*first).clone(),
            });
        }
        tracing::info!(
            imported = self.bulk_imported.load(Ordering::Relaxed),
            "bulk import complete"
        );
        Ok(())
    }

    // ── Backend mirroring ────────────────────────────────────────────

    /// Forward a put to the backend. On failure, resolve the ambiguous
    /// commit state by querying the backend rather than retrying.
    fn mirror_put(&self, key: &[u8], entry: &Arc<Entry>) -> Result<(), StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let bytes = serialize(entry)?;
        match backend.put(key, &bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                self.raise_alert(ALERT_BACKEND_DEGRADED, &err.to_string());
                if backend.confirm_committed(key, Some(&bytes))? {
                    tracing::warn!(dn = %entry.dn(), error = %err,
                        "backend reported failure but the write is durable; proceeding");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn mirror_delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        match backend.delete(key) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                self.raise_alert(ALERT_BACKEND_DEGRADED, &err.to_string());
                if backend.confirm_committed(key, None)? {
                    tracing::warn!(error = %err,
                        "backend reported failure but the delete is durable; proceeding");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

fn serialize(entry: &Entry) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(entry)
        .map_err(|e| StoreError::Persistence(format!("entry serialization failed: {e}")))
}

/// Rewrite `dn`'s suffix: the components below `old_base` are kept, the
/// `old_base` suffix is replaced by `new_base`.
fn rebase(dn: &Dn, old_base: &Dn, new_base: &Dn) -> Dn {
    let keep = dn.depth() - old_base.depth();
    let mut rdns = dn.rdns()[..keep].to_vec();
    rdns.extend_from_slice(new_base.rdns());
    Dn::from_rdns(rdns)
}
