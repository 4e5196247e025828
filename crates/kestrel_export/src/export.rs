//! Streaming export and bulk import.
//!
//! The exporter scans the store in containment order, applies the selection
//! policy per entry without materializing the result set, projects each
//! accepted entry, and writes LDIF through the finalized transform
//! pipeline. The importer is the counterpart: it parses LDIF into the
//! store under bulk-import mode, so records may arrive in any order, and
//! finishes with the referential post-pass.

use std::io::BufRead;
use std::time::{Duration, Instant};

use kestrel_common::config::SearchScope;
use kestrel_common::dn::Dn;
use kestrel_common::error::{ExportError, StoreError};
use kestrel_common::schema::SchemaProvider;
use kestrel_store::EntryStore;

use crate::ldif::{LdifReader, LdifWriter};
use crate::policy::SelectionPolicy;
use crate::sink::{ExportDestination, TransformSinkBuilder};

/// Result of a completed export.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportSummary {
    pub entries_written: u64,
    pub entries_skipped: u64,
    /// True when a size or time limit cut the export short.
    pub truncated: bool,
    /// Bytes that reached the destination (post-compression).
    pub bytes_written: u64,
    /// Hex SHA-256 of the destination stream, when hashing was enabled.
    pub digest: Option<String>,
    /// Hex HMAC-SHA256 over the digest, when signing was enabled.
    pub signature: Option<String>,
}

/// Streams a filtered, projected view of the store as LDIF.
pub struct LdifExporter<'a> {
    store: &'a EntryStore,
    schema: &'a dyn SchemaProvider,
    policy: SelectionPolicy,
    wrap_column: usize,
}

impl<'a> LdifExporter<'a> {
    pub fn new(
        store: &'a EntryStore,
        schema: &'a dyn SchemaProvider,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            store,
            schema,
            policy,
            wrap_column: 76,
        }
    }

    pub fn wrap_column(mut self, column: usize) -> Self {
        self.wrap_column = column;
        self
    }

    /// Run the export. The transform options in `builder` are finalized
    /// here; a destination that fails to open aborts before any data is
    /// written.
    pub fn export(
        &self,
        mut builder: TransformSinkBuilder,
        destination: ExportDestination,
    ) -> Result<ExportSummary, ExportError> {
        let sink = builder.open(destination)?;
        let mut writer = LdifWriter::new(sink, self.wrap_column);

        let deadline = (self.policy.time_limit_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(self.policy.time_limit_ms));
        let mut written: u64 = 0;
        let mut skipped: u64 = 0;
        let mut truncated = false;

        for entry in self.store.scan(&Dn::root(), SearchScope::WholeSubtree) {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    truncated = true;
                    break;
                }
            }
            if !self.policy.includes_entry(&entry, self.schema) {
                skipped += 1;
                continue;
            }
            if self.policy.size_limit > 0 && written == self.policy.size_limit as u64 {
                truncated = true;
                break;
            }
            let projected = self.policy.project(&entry);
            writer.write_entry(&projected)?;
            written += 1;
        }

        writer.flush()?;
        let summary = writer.into_inner().close()?;
        tracing::info!(
            entries = written,
            skipped,
            truncated,
            bytes = summary.bytes_written,
            "ldif export complete"
        );
        Ok(ExportSummary {
            entries_written: written,
            entries_skipped: skipped,
            truncated,
            bytes_written: summary.bytes_written,
            digest: summary.digest,
            signature: summary.signature,
        })
    }
}

/// Loads LDIF records into a store under bulk-import mode.
pub struct LdifImporter<'a> {
    store: &'a EntryStore,
}

impl<'a> LdifImporter<'a> {
    pub fn new(store: &'a EntryStore) -> Self {
        Self { store }
    }

    /// Import every record from `input`. Records may reference parents that
    /// appear later in the stream; the referential check runs as a
    /// post-pass. Returns the number of imported entries.
    pub fn import<R: BufRead>(&self, input: R) -> Result<u64, StoreError> {
        self.store.begin_bulk_import();
        let result = self.import_inner(input);
        match result {
            Ok(count) => {
                self.store.end_bulk_import()?;
                tracing::info!(entries = count, "ldif import complete");
                Ok(count)
            }
            Err(err) => {
                // Leave bulk mode armed off even on failure; the caller
                // owns cleanup of partially imported data.
                let _ = self.store.end_bulk_import();
                Err(err)
            }
        }
    }

    fn import_inner<R: BufRead>(&self, input: R) -> Result<u64, StoreError> {
        let mut reader = LdifReader::new(input);
        let mut count = 0;
        loop {
            let entry = reader
                .next_entry()
                .map_err(|e| StoreError::Persistence(format!("ldif import: {e}")))?;
            let Some(entry) = entry else { break };
            self.store.put(entry)?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};

    use kestrel_common::config::SearchScope;
    use kestrel_common::entry::Entry;
    use kestrel_common::filter::Filter;
    use kestrel_common::schema::CoreSchema;

    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn seeded_store() -> EntryStore {
        let store = EntryStore::default();
        store
            .put(Entry::new(dn("dc=example")).with_attr("objectClass", &["top", "domain"]))
            .unwrap();
        store
            .put(
                Entry::new(dn("ou=people,dc=example"))
                    .with_attr("objectClass", &["top", "organizationalUnit"]),
            )
            .unwrap();
        store
            .put(
                Entry::new(dn("ou=groups,dc=example"))
                    .with_attr("objectClass", &["top", "organizationalUnit"]),
            )
            .unwrap();
        store
            .put(
                Entry::new(dn("uid=bob,ou=people,dc=example"))
                    .with_attr("objectClass", &["top", "person"])
                    .with_attr("uid", &["bob"])
                    .with_attr("cn", &["Bob Smith", "Bobby"])
                    .with_attr("userPassword", &["secret"]),
            )
            .unwrap();
        store
    }

    /// Shared growable buffer destination.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn export_to_string(store: &EntryStore, policy: SelectionPolicy) -> (String, ExportSummary) {
        let schema = CoreSchema::new();
        let buf = SharedBuf::default();
        let summary = LdifExporter::new(store, &schema, policy)
            .export(
                TransformSinkBuilder::new(),
                ExportDestination::writer(buf.clone()),
            )
            .unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        (text, summary)
    }

    #[test]
    fn unrestricted_export_then_import_round_trips() {
        let store = seeded_store();
        let (text, summary) = export_to_string(&store, SelectionPolicy::new());
        assert_eq!(summary.entries_written, 4);
        assert_eq!(summary.entries_skipped, 0);
        assert!(!summary.truncated);

        let restored = EntryStore::default();
        let imported = LdifImporter::new(&restored)
            .import(Cursor::new(text))
            .unwrap();
        assert_eq!(imported, 4);
        assert_eq!(restored.len(), store.len());

        for original in store.scan(&Dn::root(), SearchScope::WholeSubtree) {
            let restored_entry = restored.get(original.dn()).unwrap();
            assert_eq!(*restored_entry, *original);
        }
    }

    #[test]
    fn policy_filters_entries_and_attributes() {
        let store = seeded_store();
        let policy = SelectionPolicy::new()
            .exclude_branch(dn("ou=groups,dc=example"))
            .exclude_attribute("userPassword");
        let (text, summary) = export_to_string(&store, policy);

        assert_eq!(summary.entries_written, 3);
        assert_eq!(summary.entries_skipped, 1);
        assert!(!text.contains("ou=groups"));
        assert!(!text.to_lowercase().contains("userpassword"));
        assert!(text.contains("uid=bob"));
    }

    #[test]
    fn include_filters_restrict_export() {
        let store = seeded_store();
        let policy =
            SelectionPolicy::new().include_filter(Filter::parse("(objectClass=person)").unwrap());
        let (_, summary) = export_to_string(&store, policy);
        assert_eq!(summary.entries_written, 1);
        assert_eq!(summary.entries_skipped, 3);
    }

    #[test]
    fn size_limit_truncates_export() {
        let store = seeded_store();
        let mut policy = SelectionPolicy::new();
        policy.size_limit = 2;
        let (_, summary) = export_to_string(&store, policy);
        assert_eq!(summary.entries_written, 2);
        assert!(summary.truncated);
    }

    #[test]
    fn compressed_hashed_export_round_trips() {
        let store = seeded_store();
        let schema = CoreSchema::new();
        let buf = SharedBuf::default();

        let mut builder = TransformSinkBuilder::new();
        builder.compress(true).unwrap();
        builder.sign_with_key(b"export-key".to_vec()).unwrap();
        let summary = LdifExporter::new(&store, &schema, SelectionPolicy::new())
            .export(builder, ExportDestination::writer(buf.clone()))
            .unwrap();

        assert!(summary.digest.is_some());
        assert!(summary.signature.is_some());

        let compressed = buf.0.lock().unwrap().clone();
        let decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let restored = EntryStore::default();
        LdifImporter::new(&restored)
            .import(std::io::BufReader::new(decoder))
            .unwrap();
        assert_eq!(restored.len(), store.len());
    }

    #[test]
    fn import_reports_orphans() {
        let text = "version: 1\ndn: uid=bob,ou=people,dc=example\nobjectClass: top\n\n";
        let store = EntryStore::default();
        let err = LdifImporter::new(&store).import(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, StoreError::OrphanedEntries { .. }));
    }

    #[test]
    fn export_to_existing_file_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.ldif");
        std::fs::write(&path, b"precious").unwrap();

        let store = seeded_store();
        let schema = CoreSchema::new();
        let err = LdifExporter::new(&store, &schema, SelectionPolicy::new())
            .export(
                TransformSinkBuilder::new(),
                ExportDestination::file(
                    &path,
                    kestrel_common::config::ExistingFileBehavior::Fail,
                ),
            )
            .unwrap_err();
        assert!(matches!(err, ExportError::DestinationExists(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    }
}
