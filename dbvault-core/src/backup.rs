/*!
Backup engine that orchestrates dump, compression, verification and cataloging.

A backup run enumerates every table through the storage port, streams the
dump to a temporary file in the backup directory, optionally re-encodes it
through the compression adapter, verifies the final artifact and only then
records it in the catalog. Nothing is cataloged unless every step succeeds.
*/

use crate::catalog::{AuditEntry, Catalog};
use crate::codec::{DumpHeader, DumpStats, DumpWriter};
use crate::compression::CompressionAdapter;
use crate::lock::{OperationGuard, OperationLock};
use crate::metadata::{BackupOptions, BackupRecord, FORMAT_VERSION};
use crate::observability;
use crate::storage::StorageAccess;
use crate::verify::{compute_checksum, verify_artifact, VerificationExpectations};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Rows per insert statement unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: u64 = 1000;

/// Backups kept by the retention policy unless configured otherwise
pub const DEFAULT_RETENTION: usize = 10;

/// Main engine for backup operations
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use dbvault_core::{BackupEngine, BackupOptions, GzipCompressor};
/// use dbvault_core::storage::sqlite::SqliteAccess;
///
/// let db = Arc::new(SqliteAccess::open("app.db")?);
/// let engine = BackupEngine::new(db, GzipCompressor::new(), "/var/backups/app")?
///     .with_retention(7);
///
/// let record = engine.create_backup(&BackupOptions::default().with_description("nightly"))?;
/// println!("{} -> {}", record.id, record.artifact_path.display());
/// # Ok::<(), dbvault_core::VaultError>(())
/// ```
pub struct BackupEngine<D, C>
where
    D: StorageAccess,
    C: CompressionAdapter,
{
    storage: Arc<D>,
    compressor: C,
    backup_dir: PathBuf,
    catalog: Mutex<Catalog>,
    retention: usize,
    chunk_size: u64,
    lock: OperationLock,
}

impl<D, C> BackupEngine<D, C>
where
    D: StorageAccess,
    C: CompressionAdapter,
{
    /// Create an engine writing into `backup_dir`, opening its catalog
    pub fn new<P: AsRef<Path>>(storage: Arc<D>, compressor: C, backup_dir: P) -> Result<Self> {
        let catalog = Catalog::open(backup_dir.as_ref())?;
        Ok(Self {
            storage,
            compressor,
            backup_dir: backup_dir.as_ref().to_path_buf(),
            catalog: Mutex::new(catalog),
            retention: DEFAULT_RETENTION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            lock: OperationLock::new(),
        })
    }

    /// Number of most recent backups to keep (at least one)
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention = keep.max(1);
        self
    }

    /// Rows fetched and written per insert statement (at least one)
    pub fn with_chunk_size(mut self, rows: u64) -> Self {
        self.chunk_size = rows.max(1);
        self
    }

    /// Share an operation lock with other engines
    pub fn with_lock(mut self, lock: OperationLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn storage(&self) -> &Arc<D> {
        &self.storage
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    fn catalog(&self) -> Result<MutexGuard<'_, Catalog>> {
        self.catalog
            .lock()
            .map_err(|_| VaultError::Lock("catalog mutex poisoned".to_string()))
    }

    /// Capture the current database state as a new cataloged backup
    ///
    /// # Errors
    /// * `VaultError::Validation` - If the options request neither structure nor data
    /// * `VaultError::BackupFailed` - If any step failed; nothing was cataloged
    #[instrument(skip(self, options), fields(description = %options.description))]
    pub fn create_backup(&self, options: &BackupOptions) -> Result<BackupRecord> {
        let guard = self.lock.acquire()?;
        self.create_backup_locked(options, &guard)
    }

    /// [`create_backup`](Self::create_backup) for callers already holding the lock
    pub(crate) fn create_backup_locked(
        &self,
        options: &BackupOptions,
        held: &OperationGuard<'_>,
    ) -> Result<BackupRecord> {
        let record = self.capture_locked(options, held)?;
        if let Err(e) = self.apply_retention() {
            warn!(backup_id = %record.id, "Retention could not be applied: {}", e);
        }
        Ok(record)
    }

    /// Run and catalog a backup without applying retention
    pub(crate) fn capture_locked(
        &self,
        options: &BackupOptions,
        _held: &OperationGuard<'_>,
    ) -> Result<BackupRecord> {
        options.validate()?;

        let operation_id = Uuid::new_v4().to_string();
        let backup_id = BackupRecord::new_id();
        let created_at = Utc::now();
        let started = Instant::now();

        info!(
            operation_id = %operation_id,
            backup_id = %backup_id,
            "Starting backup"
        );

        let record = match self.run_backup(&backup_id, created_at, started, options) {
            Ok(record) => record,
            Err(e) => {
                let elapsed = started.elapsed();
                error!(
                    operation_id = %operation_id,
                    backup_id = %backup_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Backup failed: {}",
                    e
                );
                observability::record_backup(false, elapsed, 0);
                return Err(VaultError::backup_failed(e));
            }
        };

        observability::record_backup(true, started.elapsed(), record.size_bytes);
        info!(
            operation_id = %operation_id,
            backup_id = %record.id,
            tables = record.table_count,
            rows = record.row_count,
            size_bytes = record.size_bytes,
            elapsed_ms = record.duration_ms,
            "Backup completed"
        );
        Ok(record)
    }

    fn run_backup(
        &self,
        backup_id: &str,
        created_at: DateTime<Utc>,
        started: Instant,
        options: &BackupOptions,
    ) -> Result<BackupRecord> {
        let tables = self.storage.list_tables()?;
        debug!("Backing up {} table(s)", tables.len());

        let header = DumpHeader {
            table_count: tables.len(),
            include_structure: options.include_structure,
            include_data: options.include_data,
            compress: options.compress,
            created_at,
            description: options.description.clone(),
        };

        let mut dump = NamedTempFile::new_in(&self.backup_dir)?;
        let stats = {
            let mut writer = DumpWriter::new(BufWriter::new(dump.as_file_mut()));
            writer.write_header(&header)?;
            for table in &tables {
                if options.include_structure {
                    let definition = self.storage.create_definition(table)?;
                    writer.write_structure(table, &definition)?;
                }
                if options.include_data {
                    let columns = self.storage.insert_columns(table)?;
                    writer.begin_data(table, &columns)?;
                    self.dump_table_data(&mut writer, table)?;
                }
            }
            writer.write_footer()?;
            let stats = writer.stats();
            writer.into_inner()?;
            stats
        };

        let (extension, algorithm) = if options.compress {
            (
                self.compressor.file_extension().to_string(),
                self.compressor.algorithm_name().to_string(),
            )
        } else {
            ("sql".to_string(), "none".to_string())
        };
        let artifact_path = self
            .backup_dir
            .join(BackupRecord::suggested_filename(backup_id, created_at, &extension));

        if options.compress {
            dump.as_file_mut().seek(SeekFrom::Start(0))?;
            let mut compressed = NamedTempFile::new_in(&self.backup_dir)?;
            {
                let mut reader = BufReader::new(dump.as_file_mut());
                let mut writer = BufWriter::new(compressed.as_file_mut());
                self.compressor.compress_stream(&mut reader, &mut writer)?;
                writer.flush()?;
            }
            compressed.as_file().sync_all()?;
            compressed.persist(&artifact_path).map_err(|e| e.error)?;
        } else {
            dump.as_file().sync_all()?;
            dump.persist(&artifact_path).map_err(|e| e.error)?;
        }

        let checksum = if options.verify {
            let expectations = if options.include_structure {
                VerificationExpectations::default().with_table_count(tables.len())
            } else {
                VerificationExpectations::default()
            };
            verify_artifact(&artifact_path, &expectations)?
                .into_result()?
                .checksum
        } else {
            compute_checksum(&artifact_path)?
        };

        let record = BackupRecord {
            id: backup_id.to_string(),
            size_bytes: fs::metadata(&artifact_path)?.len(),
            artifact_path,
            created_at,
            duration_ms: started.elapsed().as_millis() as u64,
            table_count: tables.len(),
            row_count: stats.rows,
            chunk_count: stats.chunks,
            checksum,
            compression_algorithm: algorithm,
            format_version: FORMAT_VERSION,
            options: options.clone(),
        };

        self.catalog()?.insert(record.clone())?;
        Ok(record)
    }

    /// Page through a table, one insert statement per non-empty page
    fn dump_table_data<W: Write>(&self, writer: &mut DumpWriter<W>, table: &str) -> Result<()> {
        let before = writer.stats();
        let mut offset = 0u64;
        loop {
            let page = self.storage.fetch_page(table, offset, self.chunk_size)?;
            let fetched = page.len() as u64;
            writer.write_rows(table, &page)?;
            if fetched < self.chunk_size {
                break;
            }
            offset += fetched;
        }

        let DumpStats { rows, chunks, .. } = writer.stats();
        debug!(
            "Dumped {} row(s) of {} in {} chunk(s)",
            rows - before.rows,
            table,
            chunks - before.chunks
        );
        Ok(())
    }

    /// All cataloged backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.catalog()?.list())
    }

    /// Look up one backup
    pub fn get_backup(&self, id: &str) -> Result<BackupRecord> {
        self.catalog()?
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::not_found(format!("backup {id}")))
    }

    /// Remove a backup's catalog entry and artifact
    #[instrument(skip(self))]
    pub fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        let _guard = self.lock.acquire()?;
        self.catalog()?.remove(id)
    }

    /// Evict backups beyond the retention bound
    pub fn apply_retention(&self) -> Result<Vec<BackupRecord>> {
        let evicted = self.catalog()?.enforce_retention(self.retention)?;
        observability::record_evictions(evicted.len());
        Ok(evicted)
    }

    /// Drop catalog entries whose artifact has disappeared
    pub fn reconcile(&self) -> Result<Vec<BackupRecord>> {
        self.catalog()?.reconcile()
    }

    /// Verify every cataloged artifact
    pub fn audit(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.catalog()?.audit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{GzipCompressor, NoCompression};
    use crate::storage::{MockStorageAccess, Row, SqlValue};
    use tempfile::TempDir;

    fn rows(start: u64, count: u64) -> Vec<Row> {
        (start..start + count)
            .map(|i| vec![SqlValue::Integer(i as i64), SqlValue::Text(format!("row {i}"))])
            .collect()
    }

    /// Mock with one table `t` holding `total` rows
    fn mock_with_rows(total: u64) -> MockStorageAccess {
        let mut mock = MockStorageAccess::new();
        mock.expect_list_tables()
            .returning(|| Ok(vec!["t".to_string()]));
        mock.expect_create_definition()
            .returning(|_| Ok("CREATE TABLE t (id INTEGER, name TEXT)".to_string()));
        mock.expect_insert_columns()
            .returning(|_| Ok(vec!["id".to_string(), "name".to_string()]));
        mock.expect_fetch_page().returning(move |_, offset, limit| {
            let count = total.saturating_sub(offset).min(limit);
            Ok(rows(offset, count))
        });
        mock
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_chunking_counts_pages() {
        let dir = TempDir::new().unwrap();
        let engine = BackupEngine::new(Arc::new(mock_with_rows(5)), GzipCompressor::new(), dir.path())
            .unwrap()
            .with_chunk_size(2);

        let record = engine.create_backup(&BackupOptions::default()).unwrap();

        assert_eq!(record.row_count, 5);
        assert_eq!(record.chunk_count, 3);
        assert_eq!(record.table_count, 1);
        assert_eq!(record.compression_algorithm, "gzip");
        assert!(record.artifact_path.to_string_lossy().ends_with(".sql.gz"));
        assert!(record.verify_integrity().is_ok());
    }

    #[test]
    fn test_exact_multiple_writes_no_empty_chunk() {
        let dir = TempDir::new().unwrap();
        let engine = BackupEngine::new(Arc::new(mock_with_rows(4)), NoCompression::new(), dir.path())
            .unwrap()
            .with_chunk_size(2);

        let record = engine
            .create_backup(&BackupOptions::default().uncompressed())
            .unwrap();

        assert_eq!(record.chunk_count, 2);
        let text = fs::read_to_string(&record.artifact_path).unwrap();
        assert_eq!(text.matches("INSERT INTO").count(), 2);
    }

    #[test]
    fn test_storage_failure_catalogs_nothing() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockStorageAccess::new();
        mock.expect_list_tables()
            .returning(|| Ok(vec!["t".to_string()]));
        mock.expect_create_definition()
            .returning(|_| Ok("CREATE TABLE t (id INTEGER)".to_string()));
        mock.expect_insert_columns()
            .returning(|_| Ok(vec!["id".to_string()]));
        mock.expect_fetch_page()
            .returning(|_, _, _| Err(VaultError::storage("connection reset")));

        let engine = BackupEngine::new(Arc::new(mock), GzipCompressor::new(), dir.path()).unwrap();
        let err = engine.create_backup(&BackupOptions::default()).unwrap_err();

        assert!(matches!(err, VaultError::BackupFailed { .. }));
        assert!(engine.list_backups().unwrap().is_empty());
        // temporary dump is removed, no artifact or index was written
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn test_verification_failure_leaves_orphan_uncataloged() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockStorageAccess::new();
        mock.expect_list_tables()
            .returning(|| Ok(vec!["v".to_string()]));
        // not a table definition, so the structure count will not match
        mock.expect_create_definition()
            .returning(|_| Ok("CREATE VIEW v AS SELECT 1".to_string()));

        let engine = BackupEngine::new(Arc::new(mock), NoCompression::new(), dir.path()).unwrap();
        let err = engine
            .create_backup(&BackupOptions::default().without_data())
            .unwrap_err();

        match err {
            VaultError::BackupFailed { source } => {
                assert!(matches!(*source, VaultError::Integrity(_)))
            }
            other => panic!("expected BackupFailed, got {other:?}"),
        }
        assert!(engine.list_backups().unwrap().is_empty());
        assert_eq!(dir_entries(dir.path()).len(), 1);
    }

    #[test]
    fn test_options_are_validated_first() {
        let dir = TempDir::new().unwrap();
        let engine = BackupEngine::new(Arc::new(MockStorageAccess::new()), GzipCompressor::new(), dir.path())
            .unwrap();

        let err = engine
            .create_backup(&BackupOptions::default().without_structure().without_data())
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn test_retention_applied_after_each_run() {
        let dir = TempDir::new().unwrap();
        let engine = BackupEngine::new(Arc::new(mock_with_rows(1)), GzipCompressor::new(), dir.path())
            .unwrap()
            .with_retention(2);

        let ids: Vec<_> = (0..4)
            .map(|_| engine.create_backup(&BackupOptions::default()).unwrap().id)
            .collect();

        let kept: Vec<_> = engine.list_backups().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(kept, vec![ids[3].clone(), ids[2].clone()]);
        assert!(matches!(engine.get_backup(&ids[0]), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_delete_backup_removes_artifact() {
        let dir = TempDir::new().unwrap();
        let engine = BackupEngine::new(Arc::new(mock_with_rows(1)), GzipCompressor::new(), dir.path())
            .unwrap();
        let record = engine.create_backup(&BackupOptions::default()).unwrap();

        engine.delete_backup(&record.id).unwrap();
        assert!(!record.artifact_path.exists());
        assert!(engine.list_backups().unwrap().is_empty());
    }
}
