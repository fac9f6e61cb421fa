/*!
Persistent catalog of completed backups.

The catalog lives in the backup directory next to the artifacts it describes,
as a single JSON index (`catalog.json`). Every mutation rewrites the index
atomically through a temporary file in the same directory.
*/

use crate::metadata::BackupRecord;
use crate::verify::{verify_artifact, VerificationExpectations, VerificationReport};
use crate::{Result, VaultError};
use dbvault_retry::{classify, local_storage_backoff_policy, with_custom_backoff, DEFAULT_MAX_ATTEMPTS};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// File name of the catalog index inside the backup directory
pub const CATALOG_FILE: &str = "catalog.json";

const INDEX_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct CatalogIndex {
    version: u8,
    records: Vec<BackupRecord>,
}

/// Result of auditing one cataloged artifact
#[derive(Debug)]
pub struct AuditEntry {
    pub id: String,
    pub outcome: Result<VerificationReport>,
}

impl AuditEntry {
    pub fn passed(&self) -> bool {
        matches!(&self.outcome, Ok(report) if report.passed)
    }
}

/// Mapping from backup id to record, persisted in the backup directory
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    records: HashMap<String, BackupRecord>,
}

impl Catalog {
    /// Open the catalog in `dir`, creating the directory if needed
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        ensure_private_dir(&dir)?;

        let index_path = dir.join(CATALOG_FILE);
        let records = if index_path.is_file() {
            let index: CatalogIndex = serde_json::from_reader(io::BufReader::new(
                fs::File::open(&index_path)?,
            ))?;
            if index.version > INDEX_VERSION {
                return Err(VaultError::validation(format!(
                    "catalog version {} is newer than supported version {}",
                    index.version, INDEX_VERSION
                )));
            }
            index
                .records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect()
        } else {
            HashMap::new()
        };

        debug!("Opened catalog {} ({} records)", index_path.display(), records.len());
        Ok(Self { dir, records })
    }

    /// Backup directory the catalog lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a record and persist the index
    pub fn insert(&mut self, record: BackupRecord) -> Result<()> {
        record.validate()?;
        self.records.insert(record.id.clone(), record);
        self.save()
    }

    pub fn get(&self, id: &str) -> Option<&BackupRecord> {
        self.records.get(id)
    }

    /// All records, newest first
    pub fn list(&self) -> Vec<BackupRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        records
    }

    /// Remove a record and its artifact
    pub fn remove(&mut self, id: &str) -> Result<BackupRecord> {
        let record = self
            .records
            .remove(id)
            .ok_or_else(|| VaultError::not_found(format!("backup {id}")))?;
        self.save()?;
        delete_artifact(&record.artifact_path)?;
        info!("Removed backup {}", id);
        Ok(record)
    }

    /// Keep the `keep` newest records and evict the rest
    ///
    /// Artifact deletion is retried, then logged and skipped on failure; the
    /// catalog entry is purged either way. Returns the evicted records.
    pub fn enforce_retention(&mut self, keep: usize) -> Result<Vec<BackupRecord>> {
        if keep == 0 {
            return Err(VaultError::validation("retention must keep at least one backup"));
        }

        let evicted: Vec<BackupRecord> = self.list().into_iter().skip(keep).collect();
        if evicted.is_empty() {
            return Ok(evicted);
        }

        for record in &evicted {
            self.records.remove(&record.id);
        }
        self.save()?;

        for record in &evicted {
            match delete_artifact(&record.artifact_path) {
                Ok(()) => debug!("Evicted backup {}", record.id),
                Err(e) => warn!(
                    "Failed to delete artifact {} of evicted backup {}: {}",
                    record.artifact_path.display(),
                    record.id,
                    e
                ),
            }
        }

        info!("Retention evicted {} backup(s), keeping {}", evicted.len(), keep);
        Ok(evicted)
    }

    /// Purge records whose artifact no longer exists
    pub fn reconcile(&mut self) -> Result<Vec<BackupRecord>> {
        let missing: Vec<String> = self
            .records
            .values()
            .filter(|record| !record.artifact_exists())
            .map(|record| record.id.clone())
            .collect();

        let purged: Vec<BackupRecord> = missing
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect();

        if !purged.is_empty() {
            warn!("Purged {} catalog entries with missing artifacts", purged.len());
            self.save()?;
        }
        Ok(purged)
    }

    /// Verify every cataloged artifact, newest first
    pub fn audit(&self) -> Vec<AuditEntry> {
        let records = self.list();
        let width = num_cpus::get().max(1);
        let mut entries = Vec::with_capacity(records.len());

        for chunk in records.chunks(width) {
            let results: Vec<AuditEntry> = chunk
                .par_iter()
                .map(|record| AuditEntry {
                    id: record.id.clone(),
                    outcome: verify_artifact(
                        &record.artifact_path,
                        &VerificationExpectations::for_record(record),
                    ),
                })
                .collect();
            entries.extend(results);
        }

        let failed = entries.iter().filter(|entry| !entry.passed()).count();
        info!("Audited {} backup(s), {} failed", entries.len(), failed);
        entries
    }

    fn save(&self) -> Result<()> {
        let index = CatalogIndex {
            version: INDEX_VERSION,
            records: self.list(),
        };

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &index)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.index_path()).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Create the backup directory, private to the current user on Unix
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| {
        VaultError::Io(io::Error::new(
            e.kind(),
            format!("Failed to create backup directory {}: {}", dir.display(), e),
        ))
    })
}

/// Delete an artifact with retries; a file that is already gone is fine
fn delete_artifact(path: &Path) -> Result<()> {
    with_custom_backoff(
        "delete_artifact",
        local_storage_backoff_policy(),
        DEFAULT_MAX_ATTEMPTS,
        |_attempt| match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify("delete_artifact", e)),
        },
    )
    .map_err(|e| VaultError::Io(io::Error::new(io::ErrorKind::Other, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupOptions, FORMAT_VERSION};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn add_record(catalog: &mut Catalog, minutes_ago: i64) -> BackupRecord {
        let id = BackupRecord::new_id();
        let created_at = Utc::now() - Duration::minutes(minutes_ago);
        let path = catalog
            .dir()
            .join(BackupRecord::suggested_filename(&id, created_at, "sql"));
        fs::write(&path, b"artifact").unwrap();

        let record = BackupRecord {
            id,
            artifact_path: path,
            size_bytes: 8,
            created_at,
            duration_ms: 1,
            table_count: 1,
            row_count: 0,
            chunk_count: 0,
            checksum: BackupRecord::compute_hash(b"artifact"),
            compression_algorithm: "none".to_string(),
            format_version: FORMAT_VERSION,
            options: BackupOptions::default(),
        };
        catalog.insert(record.clone()).unwrap();
        record
    }

    #[test]
    fn test_open_creates_directory_and_persists() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("nested").join("backups");

        let mut catalog = Catalog::open(&dir).unwrap();
        assert!(catalog.is_empty());
        let record = add_record(&mut catalog, 0);

        let reopened = Catalog::open(&dir).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&record.id), Some(&record));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_list_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let old = add_record(&mut catalog, 30);
        let new = add_record(&mut catalog, 1);
        let mid = add_record(&mut catalog, 10);

        let ids: Vec<_> = catalog.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![new.id, mid.id, old.id]);
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let records: Vec<_> = (0..5).map(|i| add_record(&mut catalog, 50 - i * 10)).collect();

        let evicted = catalog.enforce_retention(2).unwrap();

        assert_eq!(evicted.len(), 3);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get(&records[4].id).is_some());
        assert!(catalog.get(&records[3].id).is_some());
        for record in &evicted {
            assert!(!record.artifact_path.exists());
        }
        assert!(catalog.enforce_retention(0).is_err());
    }

    #[test]
    fn test_retention_purges_entry_even_when_artifact_is_gone() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let old = add_record(&mut catalog, 20);
        add_record(&mut catalog, 10);
        fs::remove_file(&old.artifact_path).unwrap();

        let evicted = catalog.enforce_retention(1).unwrap();
        assert_eq!(evicted[0].id, old.id);
        assert!(catalog.get(&old.id).is_none());
    }

    #[test]
    fn test_retention_survives_undeletable_artifact() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let old = add_record(&mut catalog, 20);
        let kept = add_record(&mut catalog, 10);

        // a non-empty directory where the artifact should be cannot be unlinked
        fs::remove_file(&old.artifact_path).unwrap();
        fs::create_dir(&old.artifact_path).unwrap();
        fs::write(old.artifact_path.join("pinned"), b"x").unwrap();

        let evicted = catalog.enforce_retention(1).unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, old.id);
        assert!(old.artifact_path.is_dir());
        assert!(catalog.get(&old.id).is_none());

        let reopened = Catalog::open(dir.path()).unwrap();
        assert!(reopened.get(&old.id).is_none());
        assert!(reopened.get(&kept.id).is_some());
    }

    #[test]
    fn test_remove_and_reconcile() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        let first = add_record(&mut catalog, 2);
        let second = add_record(&mut catalog, 1);

        catalog.remove(&first.id).unwrap();
        assert!(!first.artifact_path.exists());
        assert!(matches!(catalog.remove(&first.id), Err(VaultError::NotFound(_))));

        fs::remove_file(&second.artifact_path).unwrap();
        let purged = catalog.reconcile().unwrap();
        assert_eq!(purged.len(), 1);
        assert!(Catalog::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_audit_reports_every_record() {
        let dir = TempDir::new().unwrap();
        let mut catalog = Catalog::open(dir.path()).unwrap();
        add_record(&mut catalog, 2);
        add_record(&mut catalog, 1);

        // the placeholder artifacts carry no header, so both fail verification
        let entries = catalog.audit();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| !entry.passed()));
        assert!(entries.iter().all(|entry| entry.outcome.is_ok()));
    }
}
