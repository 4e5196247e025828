use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_common::config::{SearchScope, StoreConfig};
use kestrel_common::dn::Dn;
use kestrel_common::entry::Entry;
use kestrel_common::error::StoreError;

use crate::backend::{MemoryBackend, PersistenceBackend};
use crate::store::EntryStore;

fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

fn entry(s: &str) -> Entry {
    Entry::new(dn(s)).with_attr("objectClass", &["top"])
}

fn seeded_store() -> EntryStore {
    let store = EntryStore::default();
    store.put(entry("dc=example")).unwrap();
    store.put(entry("ou=people,dc=example")).unwrap();
    store.put(entry("ou=groups,dc=example")).unwrap();
    store.put(entry("uid=bob,ou=people,dc=example")).unwrap();
    store.put(entry("uid=alice,ou=people,dc=example")).unwrap();
    store
}

mod basic {
    use super::*;

    #[test]
    fn put_get_exists() {
        let store = seeded_store();
        assert_eq!(store.len(), 5);
        let bob = store.get(&dn("uid=bob,ou=people,dc=example")).unwrap();
        assert_eq!(bob.dn(), &dn("UID=Bob, OU=People, DC=Example"));
        assert!(store.exists(&dn("ou=groups,dc=example")));
        assert!(store.get(&dn("uid=carol,ou=people,dc=example")).is_none());
    }

    #[test]
    fn duplicate_put_rejected() {
        let store = seeded_store();
        let err = store.put(entry("ou=People, dc=Example")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEntry(_)));
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn orphan_put_rejected() {
        let store = seeded_store();
        let err = store.put(entry("uid=x,ou=missing,dc=example")).unwrap_err();
        match err {
            StoreError::NoSuchParent(parent) => assert_eq!(parent, dn("ou=missing,dc=example")),
            other => panic!("expected NoSuchParent, got {other}"),
        }
    }

    #[test]
    fn root_level_entries_need_no_parent() {
        let store = EntryStore::default();
        store.put(entry("dc=standalone")).unwrap();
        assert!(store.exists(&dn("dc=standalone")));
    }

    #[test]
    fn replace_swaps_attributes_in_place() {
        let store = seeded_store();
        let target = dn("uid=bob,ou=people,dc=example");
        let updated = Entry::new(target.clone())
            .with_attr("objectClass", &["top", "person"])
            .with_attr("mail", &["bob@example.com"]);
        let (previous, stored) = store.replace(updated).unwrap();
        assert!(!previous.has_attribute("mail"));
        assert!(stored.has_attribute("mail"));
        assert_eq!(
            store.get(&target).unwrap().values("mail"),
            &["bob@example.com".to_string()]
        );

        let missing = Entry::new(dn("uid=ghost,dc=example"));
        assert!(matches!(
            store.replace(missing).unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn replace_if_detects_lost_update() {
        let store = seeded_store();
        let target = dn("uid=bob,ou=people,dc=example");
        let snapshot = store.get(&target).unwrap();

        // A competing writer lands first.
        let competing = Entry::new(target.clone()).with_attr("objectClass", &["top", "person"]);
        store.replace(competing).unwrap();

        // The stale CAS loses with a retryable error, not a silent overwrite.
        let stale = Entry::new(target.clone()).with_attr("description", &["stale"]);
        assert!(matches!(
            store.replace_if(&snapshot, stale).unwrap_err(),
            StoreError::ConcurrentModification(_)
        ));
        assert!(!store.get(&target).unwrap().has_attribute("description"));

        // A CAS computed from the current snapshot wins.
        let current = store.get(&target).unwrap();
        let next = Entry::new(target.clone())
            .with_attr("objectClass", &["top", "person"])
            .with_attr("description", &["fresh"]);
        store.replace_if(&current, next).unwrap();
        assert!(store.get(&target).unwrap().has_attribute("description"));
    }
}

mod removal {
    use super::*;

    #[test]
    fn leaf_only_delete_scenario() {
        let store = EntryStore::default();
        store.put(entry("dc=example")).unwrap();
        store.put(entry("ou=people,dc=example")).unwrap();

        // Deleting the non-leaf base fails and changes nothing.
        let err = store.remove(&dn("dc=example")).unwrap_err();
        assert!(matches!(err, StoreError::NotLeaf(_)));
        assert_eq!(store.len(), 2);

        // Leaf first, then the base: both succeed.
        store.remove(&dn("ou=people,dc=example")).unwrap();
        store.remove(&dn("dc=example")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn remove_missing_is_not_found() {
        let store = seeded_store();
        assert!(matches!(
            store.remove(&dn("uid=ghost,dc=example")).unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn recursive_delete_is_config_gated() {
        let store = seeded_store();
        assert!(matches!(
            store.remove_subtree(&dn("ou=people,dc=example")).unwrap_err(),
            StoreError::RecursiveDeleteDisabled
        ));

        let store = EntryStore::new(StoreConfig {
            allow_recursive_delete: true,
            ..StoreConfig::default()
        });
        store.put(entry("dc=example")).unwrap();
        store.put(entry("ou=people,dc=example")).unwrap();
        store.put(entry("uid=bob,ou=people,dc=example")).unwrap();

        let removed = store.remove_subtree(&dn("ou=people,dc=example")).unwrap();
        // Children come back first.
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].dn(), &dn("uid=bob,ou=people,dc=example"));
        assert_eq!(removed[1].dn(), &dn("ou=people,dc=example"));
        assert_eq!(store.len(), 1);
    }
}

mod rename {
    use super::*;

    #[test]
    fn rename_moves_whole_subtree() {
        let store = seeded_store();
        let (before, after) = store
            .rename(&dn("ou=people,dc=example"), &dn("ou=staff,dc=example"), None)
            .unwrap();
        assert_eq!(before.dn(), &dn("ou=people,dc=example"));
        assert_eq!(after.dn(), &dn("ou=staff,dc=example"));

        assert!(!store.exists(&dn("ou=people,dc=example")));
        assert!(!store.exists(&dn("uid=bob,ou=people,dc=example")));
        assert!(store.exists(&dn("uid=bob,ou=staff,dc=example")));
        assert!(store.exists(&dn("uid=alice,ou=staff,dc=example")));
        // Attributes survive the move.
        assert!(store
            .get(&dn("uid=bob,ou=staff,dc=example"))
            .unwrap()
            .has_attribute("objectClass"));
    }

    #[test]
    fn rename_collision_and_missing_parent_rejected() {
        let store = seeded_store();
        assert!(matches!(
            store
                .rename(&dn("ou=people,dc=example"), &dn("ou=groups,dc=example"), None)
                .unwrap_err(),
            StoreError::DuplicateEntry(_)
        ));
        assert!(matches!(
            store
                .rename(&dn("ou=people,dc=example"), &dn("ou=people,dc=missing"), None)
                .unwrap_err(),
            StoreError::NoSuchParent(_)
        ));
        assert!(matches!(
            store
                .rename(
                    &dn("ou=people,dc=example"),
                    &dn("ou=nested,uid=bob,ou=people,dc=example"),
                    None
                )
                .unwrap_err(),
            StoreError::RenameIntoOwnSubtree(_)
        ));
    }
}

mod scans {
    use super::*;

    fn dns(entries: &[Arc<Entry>]) -> Vec<String> {
        entries.iter().map(|e| e.dn().to_string()).collect()
    }

    #[test]
    fn scope_base() {
        let store = seeded_store();
        let hits = store.scan(&dn("ou=people,dc=example"), SearchScope::Base);
        assert_eq!(dns(&hits), ["ou=people,dc=example"]);
        assert!(store.scan(&dn("ou=missing,dc=example"), SearchScope::Base).is_empty());
    }

    #[test]
    fn scope_one_level() {
        let store = seeded_store();
        let hits = store.scan(&dn("dc=example"), SearchScope::OneLevel);
        assert_eq!(hits.len(), 2);
        assert!(dns(&hits).iter().all(|d| d.starts_with("ou=")));
    }

    #[test]
    fn scope_whole_subtree_orders_parents_first() {
        let store = seeded_store();
        let hits = store.scan(&dn("dc=example"), SearchScope::WholeSubtree);
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].dn(), &dn("dc=example"));
        // Every entry appears after its parent.
        for (i, e) in hits.iter().enumerate() {
            if let Some(parent) = e.dn().parent() {
                if !parent.is_root() {
                    let parent_pos = hits.iter().position(|p| p.dn() == &parent).unwrap();
                    assert!(parent_pos < i);
                }
            }
        }
    }

    #[test]
    fn scope_subordinate_excludes_base() {
        let store = seeded_store();
        let hits = store.scan(&dn("ou=people,dc=example"), SearchScope::SubordinateSubtree);
        assert_eq!(hits.len(), 2);
        assert!(!dns(&hits).contains(&"ou=people,dc=example".to_string()));
    }

    #[test]
    fn root_subtree_scan_sees_everything() {
        let store = seeded_store();
        assert_eq!(store.scan(&Dn::root(), SearchScope::WholeSubtree).len(), 5);
        assert_eq!(store.scan(&Dn::root(), SearchScope::OneLevel).len(), 1);
        assert!(store.scan(&Dn::root(), SearchScope::Base).is_empty());
    }

    #[test]
    fn sibling_prefix_names_do_not_bleed_into_subtree() {
        let store = EntryStore::default();
        store.put(entry("dc=example")).unwrap();
        store.put(entry("ou=people,dc=example")).unwrap();
        store.put(entry("ou=people2,dc=example")).unwrap();
        store.put(entry("uid=bob,ou=people,dc=example")).unwrap();

        let hits = store.scan(&dn("ou=people,dc=example"), SearchScope::WholeSubtree);
        assert_eq!(hits.len(), 2, "ou=people2 must not appear under ou=people");
    }
}

mod bulk_import {
    use super::*;

    #[test]
    fn children_may_arrive_before_parents() {
        let store = EntryStore::default();
        store.begin_bulk_import();
        store.put(entry("uid=bob,ou=people,dc=example")).unwrap();
        store.put(entry("ou=people,dc=example")).unwrap();
        store.put(entry("dc=example")).unwrap();
        store.end_bulk_import().unwrap();
        assert_eq!(store.len(), 3);

        // Back to strict mode afterwards.
        assert!(matches!(
            store.put(entry("uid=x,ou=missing,dc=example")).unwrap_err(),
            StoreError::NoSuchParent(_)
        ));
    }

    #[test]
    fn orphans_reported_by_post_pass() {
        let store = EntryStore::default();
        store.begin_bulk_import();
        store.put(entry("dc=example")).unwrap();
        store.put(entry("uid=bob,ou=people,dc=example")).unwrap();
        let err = store.end_bulk_import().unwrap_err();
        match err {
            StoreError::OrphanedEntries { count, first } => {
                assert_eq!(count, 1);
                assert_eq!(first, dn("uid=bob,ou=people,dc=example"));
            }
            other => panic!("expected OrphanedEntries, got {other}"),
        }
    }
}

mod persistence {
    use super::*;

    /// Wraps MemoryBackend and fails puts/deletes on demand; `apply_anyway`
    /// simulates the ambiguous case where the backend errored after the
    /// mutation became durable.
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_writes: AtomicBool,
        apply_anyway: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_writes: AtomicBool::new(false),
                apply_anyway: AtomicBool::new(false),
            }
        }
    }

    impl PersistenceBackend for FlakyBackend {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                if self.apply_anyway.load(Ordering::Relaxed) {
                    self.inner.put(key, value)?;
                }
                return Err(StoreError::Persistence("injected put failure".into()));
            }
            self.inner.put(key, value)
        }

        fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                if self.apply_anyway.load(Ordering::Relaxed) {
                    self.inner.delete(key)?;
                }
                return Err(StoreError::Persistence("injected delete failure".into()));
            }
            self.inner.delete(key)
        }

        fn range_scan(
            &self,
            start: &[u8],
            end: &[u8],
        ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
            self.inner.range_scan(start, end)
        }
    }

    #[test]
    fn mutations_mirror_to_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let store = EntryStore::default().with_backend(backend.clone());
        store.put(entry("dc=example")).unwrap();
        store.put(entry("ou=people,dc=example")).unwrap();
        assert_eq!(backend.len(), 2);
        store.remove(&dn("ou=people,dc=example")).unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn unconfirmed_backend_failure_aborts_cleanly() {
        let backend = Arc::new(FlakyBackend::new());
        let store = EntryStore::default().with_backend(backend.clone());
        store.put(entry("dc=example")).unwrap();

        backend.fail_writes.store(true, Ordering::Relaxed);
        let err = store.put(entry("ou=people,dc=example")).unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
        // Fails clean: the in-memory store never saw the entry.
        assert!(!store.exists(&dn("ou=people,dc=example")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn confirmed_backend_failure_is_treated_as_committed() {
        let backend = Arc::new(FlakyBackend::new());
        let store = EntryStore::default().with_backend(backend.clone());
        store.put(entry("dc=example")).unwrap();

        backend.fail_writes.store(true, Ordering::Relaxed);
        backend.apply_anyway.store(true, Ordering::Relaxed);
        // The backend errored, but querying it shows the write took effect.
        store.put(entry("ou=people,dc=example")).unwrap();
        assert!(store.exists(&dn("ou=people,dc=example")));
    }

    #[test]
    fn backend_failure_raises_declared_alert() {
        use kestrel_common::alert::{AlertRouter, AlertTransport};

        #[derive(Default)]
        struct CountingTransport(std::sync::atomic::AtomicU64);
        struct SharedTransport(Arc<CountingTransport>);
        impl AlertTransport for SharedTransport {
            fn forward(&self, _component: &str, _alert: &str, _message: &str) {
                self.0 .0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let transport = Arc::new(CountingTransport::default());
        let router = Arc::new(AlertRouter::new(Box::new(SharedTransport(transport.clone()))));
        let backend = Arc::new(FlakyBackend::new());
        let store = EntryStore::default()
            .with_backend(backend.clone())
            .with_alerts(router.clone());

        store.put(entry("dc=example")).unwrap();
        backend.fail_writes.store(true, Ordering::Relaxed);
        let _ = store.put(entry("ou=people,dc=example"));

        assert_eq!(transport.0.load(Ordering::Relaxed), 1);
        assert_eq!(router.forwarded_count(), 1);
        assert_eq!(router.rejected_count(), 0);
    }

    #[test]
    fn recover_rebuilds_from_backend() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = EntryStore::default().with_backend(backend.clone());
            store.put(entry("dc=example")).unwrap();
            store.put(entry("ou=people,dc=example")).unwrap();
            store.put(entry("uid=bob,ou=people,dc=example")).unwrap();
        }
        let recovered = EntryStore::recover(StoreConfig::default(), backend).unwrap();
        assert_eq!(recovered.len(), 3);
        assert!(recovered.exists(&dn("uid=bob,ou=people,dc=example")));
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn concurrent_adds_under_distinct_parents() {
        let store = Arc::new(EntryStore::default());
        store.put(entry("dc=example")).unwrap();
        const N: usize = 16;
        for i in 0..N {
            store.put(entry(&format!("ou=dept{i},dc=example"))).unwrap();
        }

        std::thread::scope(|s| {
            for i in 0..N {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    store
                        .put(entry(&format!("uid=worker,ou=dept{i},dc=example")))
                        .unwrap();
                });
            }
        });

        let hits = store.scan(&dn("dc=example"), SearchScope::WholeSubtree);
        // 1 base + N departments + N workers, no duplicates, none missing.
        assert_eq!(hits.len(), 1 + 2 * N);
        let workers = hits
            .iter()
            .filter(|e| e.dn().rdn().map(|r| r.normalized() == "uid=worker").unwrap_or(false))
            .count();
        assert_eq!(workers, N);
    }

    #[test]
    fn generation_advances_on_structural_change_only() {
        let store = seeded_store();
        let g0 = store.generation();
        let target = dn("uid=bob,ou=people,dc=example");
        let updated = Entry::new(target).with_attr("objectClass", &["top", "person"]);
        store.replace(updated).unwrap();
        assert_eq!(store.generation(), g0);
        store.put(entry("ou=extra,dc=example")).unwrap();
        assert!(store.generation() > g0);
    }

    #[test]
    fn stats_track_operations() {
        let store = seeded_store();
        store.remove(&dn("uid=alice,ou=people,dc=example")).unwrap();
        store.scan(&Dn::root(), SearchScope::WholeSubtree);
        let stats = store.stats();
        assert_eq!(stats.adds, 5);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.scans, 1);
        assert_eq!(stats.entry_count, 4);
    }
}
