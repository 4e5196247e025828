//! Change-notification fan-out.
//!
//! Listeners register for the operation kinds they care about; the table is
//! keyed by kind and preserves registration order. `notify` runs on the
//! committing thread, synchronously, before the operation is reported
//! complete — slow listeners directly delay the committing operation. That
//! trade is deliberate: deterministic commit-visibility over throughput.
//!
//! A listener that fails or panics is isolated: its failure is logged and
//! counted, and the remaining listeners still run. The mutation has already
//! committed and cannot be rolled back by a notification problem.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use kestrel_common::dn::Dn;
use kestrel_common::entry::Entry;

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Delete,
    Modify,
    ModifyDn,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Delete => write!(f, "DELETE"),
            Self::Modify => write!(f, "MODIFY"),
            Self::ModifyDn => write!(f, "MODIFYDN"),
        }
    }
}

/// One committed mutation, produced exactly once per commit and handed to
/// every interested listener before the operation returns to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Commit-order operation id.
    pub op_id: u64,
    pub kind: ChangeKind,
    /// The entry's DN at the time the operation targeted it (the old DN
    /// for ModifyDn).
    pub target_dn: Dn,
    /// Pre-image: Delete, Modify, ModifyDn.
    pub before: Option<Arc<Entry>>,
    /// Post-image: Add, Modify, ModifyDn.
    pub after: Option<Arc<Entry>>,
    /// Wall-clock commit time (unix millis).
    pub timestamp_ms: u64,
}

impl ChangeNotification {
    pub(crate) fn new(
        op_id: u64,
        kind: ChangeKind,
        target_dn: Dn,
        before: Option<Arc<Entry>>,
        after: Option<Arc<Entry>>,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            op_id,
            kind,
            target_dn,
            before,
            after,
            timestamp_ms,
        }
    }
}

/// Implemented by components that need commit visibility (replication,
/// caches, indexes). Must determine applicability and return quickly.
pub trait ChangeListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_change(&self, event: &ChangeNotification) -> Result<(), String>;
}

struct Registered {
    id: u64,
    listener: Arc<dyn ChangeListener>,
}

/// Fan-out table: operation kind → ordered listeners.
pub struct ChangeDispatcher {
    table: RwLock<HashMap<ChangeKind, Vec<Registered>>>,
    next_registration: AtomicU64,
    delivered: AtomicU64,
    listener_failures: AtomicU64,
}

impl Default for ChangeDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDispatcher {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
        }
    }

    /// Register a listener for the given kinds. Returns a registration id
    /// usable with [`ChangeDispatcher::unregister`].
    pub fn register(&self, kinds: &[ChangeKind], listener: Arc<dyn ChangeListener>) -> u64 {
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.write();
        for kind in kinds {
            table.entry(*kind).or_default().push(Registered {
                id,
                listener: listener.clone(),
            });
        }
        id
    }

    pub fn unregister(&self, registration_id: u64) {
        let mut table = self.table.write();
        for listeners in table.values_mut() {
            listeners.retain(|r| r.id != registration_id);
        }
    }

    /// Deliver one committed event to every listener registered for its
    /// kind, in registration order, on the calling (committing) thread.
    pub fn notify(&self, event: &ChangeNotification) {
        // Snapshot outside the invocation so a listener may (un)register
        // without deadlocking.
        let listeners: Vec<(u64, Arc<dyn ChangeListener>)> = {
            let table = self.table.read();
            match table.get(&event.kind) {
                Some(list) => list.iter().map(|r| (r.id, r.listener.clone())).collect(),
                None => return,
            }
        };

        for (id, listener) in listeners {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener.on_change(event)));
            match outcome {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(reason)) => {
                    self.listener_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        listener = listener.name(),
                        registration = id,
                        op_id = event.op_id,
                        kind = %event.kind,
                        "change listener failed: {reason}"
                    );
                }
                Err(payload) => {
                    self.listener_failures.fetch_add(1, Ordering::Relaxed);
                    let message = panic_message(&payload);
                    tracing::error!(
                        listener = listener.name(),
                        registration = id,
                        op_id = event.op_id,
                        kind = %event.kind,
                        "change listener panicked: {message}"
                    );
                }
            }
        }
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
