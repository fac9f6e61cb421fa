/*!
Recovery engine that replays a cataloged backup into the database.

A restore runs these steps in order, under the same operation lock as backups:

1. lookup the record and its artifact
2. optional pre-verification (checksum, header, shape)
3. optional safety snapshot of the current database state
4. transactional replay with referential-integrity checks disabled
5. optional post-verification of the restored database

Any failure during replay rolls the transaction back. Post-verification runs
after commit and can only report.
*/

use crate::backup::BackupEngine;
use crate::codec::{DumpHeader, Statement, StatementKind, StatementReader};
use crate::compression::{open_artifact, CompressionAdapter};
#[cfg(feature = "sqlite")]
use crate::compression::GzipCompressor;
#[cfg(feature = "sqlite")]
use crate::config::{DatabaseConfig, VaultConfig};
use crate::lock::OperationGuard;
use crate::metadata::{BackupOptions, BackupRecord};
use crate::observability;
#[cfg(feature = "sqlite")]
use crate::storage::sqlite::SqliteAccess;
use crate::storage::StorageAccess;
use crate::verify::{verify_artifact, VerificationExpectations};
use crate::{Result, VaultError};
use dbvault_retry::{database_backoff_policy, transient_error, with_custom_backoff, DEFAULT_MAX_ATTEMPTS};
use serde::Serialize;
use std::collections::HashSet;
use std::io::BufRead;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Bytes of each statement kept while analysing coverage
const COVERAGE_CAPTURE: usize = 256;

/// Statements scanned at most while analysing coverage
const COVERAGE_SCAN_LIMIT: usize = 100_000;

/// Caller-supplied options for one restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Only replay statements targeting these tables (case-sensitive)
    pub tables: Option<Vec<String>>,
    /// Verify the artifact before touching the database
    pub verify_before: bool,
    /// Check the database after commit
    pub verify_after: bool,
    /// Take a safety snapshot before mutating anything
    pub create_backup: bool,
    /// Parse the artifact without executing anything
    pub dry_run: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            tables: None,
            verify_before: true,
            verify_after: true,
            create_backup: true,
            dry_run: false,
        }
    }
}

impl RecoveryOptions {
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn without_safety_backup(mut self) -> Self {
        self.create_backup = false;
        self
    }

    pub fn without_verify_before(mut self) -> Self {
        self.verify_before = false;
        self
    }

    pub fn without_verify_after(mut self) -> Self {
        self.verify_after = false;
        self
    }
}

/// Outcome of a restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub backup_id: String,
    pub success: bool,
    /// Snapshot taken before the restore, for manual rollback
    pub safety_backup_id: Option<String>,
    pub duration: Duration,
    pub dry_run: bool,
    /// Statements executed (or that would be, in a dry run)
    pub statements_executed: u64,
    /// Statements excluded by the table allow-list
    pub statements_skipped: u64,
    /// Tables touched by the replayed statements, in artifact order
    pub tables_restored: Vec<String>,
}

/// Which tables an artifact can restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub backup_id: String,
    /// Tables in artifact order
    pub tables: Vec<String>,
    pub has_data: bool,
    /// False when the scan limit was hit before every table was seen
    pub complete: bool,
}

#[derive(Debug, Default)]
struct ReplayStats {
    executed: u64,
    skipped: u64,
    structures: usize,
    tables: Vec<String>,
}

impl ReplayStats {
    fn record(&mut self, statement: &Statement) {
        self.executed += 1;
        if statement.kind == StatementKind::CreateTable {
            self.structures += 1;
        }
        if let Some(table) = &statement.table {
            if !self.tables.contains(table) {
                self.tables.push(table.clone());
            }
        }
    }
}

/// Re-enables integrity checks when dropped
struct IntegrityChecksGuard<'a, D: StorageAccess>(&'a D);

impl<D: StorageAccess> Drop for IntegrityChecksGuard<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.0.set_integrity_checks(true) {
            error!("Failed to re-enable integrity checks: {}", e);
        }
    }
}

fn missing_marker() -> VaultError {
    VaultError::integrity("artifact ends before its completion marker (truncated?)")
}

fn is_retained(statement: &Statement, allow: Option<&HashSet<String>>) -> bool {
    match allow {
        None => true,
        Some(allow) => statement
            .table
            .as_ref()
            .is_some_and(|table| allow.contains(table)),
    }
}

/// Engine for restore operations
///
/// Wraps a [`BackupEngine`] for catalog access, safety snapshots and the
/// shared operation lock.
pub struct RecoveryEngine<D, C>
where
    D: StorageAccess,
    C: CompressionAdapter,
{
    backup: Arc<BackupEngine<D, C>>,
}

impl<D, C> RecoveryEngine<D, C>
where
    D: StorageAccess,
    C: CompressionAdapter,
{
    pub fn new(backup: Arc<BackupEngine<D, C>>) -> Self {
        Self { backup }
    }

    pub fn backup_engine(&self) -> &Arc<BackupEngine<D, C>> {
        &self.backup
    }

    /// Restore the database from a cataloged backup
    ///
    /// # Errors
    /// * `VaultError::NotFound` - Unknown id or missing artifact
    /// * `VaultError::IntegrityCheckFailed` / `VaultError::Integrity` - Pre-verification failed
    /// * `VaultError::RestoreFailed` - Replay failed and was rolled back
    /// * `VaultError::VerificationFailed` - Post-restore checks failed; data is committed
    #[instrument(skip(self, options), fields(dry_run = options.dry_run))]
    pub fn restore(&self, backup_id: &str, options: &RecoveryOptions) -> Result<RecoveryReport> {
        let guard = self.backup.lock().acquire()?;
        let operation_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        info!(operation_id = %operation_id, backup_id, "Starting restore");
        let result = self.restore_locked(backup_id, options, &guard, started);

        let elapsed = started.elapsed();
        match &result {
            Ok(report) => {
                observability::record_restore(true, elapsed, report.statements_executed);
                info!(
                    operation_id = %operation_id,
                    backup_id,
                    statements = report.statements_executed,
                    skipped = report.statements_skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    dry_run = report.dry_run,
                    "Restore completed"
                );
            }
            Err(e) => {
                observability::record_restore(false, elapsed, 0);
                error!(
                    operation_id = %operation_id,
                    backup_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Restore failed: {}",
                    e
                );
            }
        }
        result
    }

    fn restore_locked(
        &self,
        backup_id: &str,
        options: &RecoveryOptions,
        guard: &OperationGuard<'_>,
        started: Instant,
    ) -> Result<RecoveryReport> {
        let record = self.lookup(backup_id)?;
        if !record.is_compatible() {
            return Err(VaultError::validation(format!(
                "backup {backup_id} has unsupported format version {}",
                record.format_version
            )));
        }

        if options.verify_before {
            verify_artifact(
                &record.artifact_path,
                &VerificationExpectations::for_record(&record),
            )?
            .into_result()?;
            debug!("Pre-restore verification passed for {}", backup_id);
        }

        let allow: Option<HashSet<String>> = options
            .tables
            .as_ref()
            .map(|tables| tables.iter().cloned().collect());

        let safety_backup_id = if options.create_backup {
            let snapshot_options = BackupOptions::default()
                .with_description(format!("Safety snapshot before restoring {backup_id}"));
            let snapshot = self.backup.capture_locked(&snapshot_options, guard)?;
            info!(backup_id, safety_backup_id = %snapshot.id, "Safety snapshot taken");
            Some(snapshot.id)
        } else {
            None
        };

        // dry runs never apply retention
        if options.dry_run {
            let stats = self.scan(&record, allow.as_ref())?;
            return Ok(RecoveryReport {
                backup_id: backup_id.to_string(),
                success: true,
                safety_backup_id,
                duration: started.elapsed(),
                dry_run: true,
                statements_executed: stats.executed,
                statements_skipped: stats.skipped,
                tables_restored: stats.tables,
            });
        }

        let replayed = self.replay(&record, allow.as_ref());

        if safety_backup_id.is_some() {
            self.retain_after_snapshot();
        }
        let stats = replayed?;

        if options.verify_after {
            self.post_verify(&stats).map_err(|reason| {
                VaultError::VerificationFailed(match &safety_backup_id {
                    Some(id) => format!("{reason} (safety snapshot: {id})"),
                    None => reason,
                })
            })?;
        }

        Ok(RecoveryReport {
            backup_id: backup_id.to_string(),
            success: true,
            safety_backup_id,
            duration: started.elapsed(),
            dry_run: false,
            statements_executed: stats.executed,
            statements_skipped: stats.skipped,
            tables_restored: stats.tables,
        })
    }

    /// Retention is deferred until the target artifact has been read
    fn retain_after_snapshot(&self) {
        if let Err(e) = self.backup.apply_retention() {
            warn!("Retention could not be applied after restore: {}", e);
        }
    }

    fn lookup(&self, backup_id: &str) -> Result<BackupRecord> {
        let record = self.backup.get_backup(backup_id)?;
        if !record.artifact_exists() {
            return Err(VaultError::not_found(format!(
                "artifact for backup {} is missing at {}",
                backup_id,
                record.artifact_path.display()
            )));
        }
        Ok(record)
    }

    /// Parse every statement, applying the allow-list, without executing
    fn scan(&self, record: &BackupRecord, allow: Option<&HashSet<String>>) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        let mut statements = StatementReader::new(open_artifact(&record.artifact_path)?);
        for statement in statements.by_ref() {
            let statement = statement?;
            if is_retained(&statement, allow) {
                stats.record(&statement);
            } else {
                stats.skipped += 1;
            }
        }
        if !statements.saw_completion_marker() {
            return Err(missing_marker());
        }
        Ok(stats)
    }

    /// Execute the artifact inside one transaction
    fn replay(&self, record: &BackupRecord, allow: Option<&HashSet<String>>) -> Result<ReplayStats> {
        let storage = self.backup.storage().as_ref();
        let reader = open_artifact(&record.artifact_path)?;

        storage.set_integrity_checks(false)?;
        let _checks = IntegrityChecksGuard(storage);
        storage.begin()?;

        let mut stats = ReplayStats::default();
        let mut statements = StatementReader::new(reader);
        let failure = loop {
            match statements.next() {
                None if statements.saw_completion_marker() => break None,
                None => break Some((statements.position() + 1, missing_marker())),
                Some(Err(e)) => {
                    let position = match &e {
                        VaultError::Codec { position, .. } => *position,
                        _ => statements.position() + 1,
                    };
                    break Some((position, e));
                }
                Some(Ok(statement)) if !is_retained(&statement, allow) => stats.skipped += 1,
                Some(Ok(statement)) => match storage.execute(&statement.text, &[]) {
                    Ok(_) => stats.record(&statement),
                    Err(e) => {
                        break Some((
                            statement.position,
                            VaultError::Execution {
                                position: statement.position,
                                message: e.to_string(),
                            },
                        ))
                    }
                },
            }
        };

        if let Some((position, cause)) = failure {
            warn!("Rolling back restore at statement {}: {}", position, cause);
            if let Err(e) = storage.rollback() {
                error!("Rollback failed: {}", e);
            }
            return Err(VaultError::restore_failed(position, cause));
        }

        if let Err(e) = storage.commit() {
            if let Err(rollback) = storage.rollback() {
                error!("Rollback after failed commit failed: {}", rollback);
            }
            return Err(VaultError::restore_failed(statements.position(), e));
        }

        debug!(
            "Replayed {} statement(s), skipped {}",
            stats.executed, stats.skipped
        );
        Ok(stats)
    }

    /// Sanity checks after commit; returns the failure reason
    fn post_verify(&self, stats: &ReplayStats) -> std::result::Result<(), String> {
        let storage = self.backup.storage();

        with_custom_backoff(
            "post_restore_ping",
            database_backoff_policy(),
            DEFAULT_MAX_ATTEMPTS,
            |_attempt| {
                storage
                    .ping()
                    .map_err(|e| transient_error!("post_restore_ping", e))
            },
        )
        .map_err(|e| format!("database unreachable after restore: {e}"))?;

        let tables = storage
            .list_tables()
            .map_err(|e| format!("cannot list tables after restore: {e}"))?;
        if tables.len() < stats.structures {
            return Err(format!(
                "expected at least {} tables after restore, found {}",
                stats.structures,
                tables.len()
            ));
        }

        for table in &tables {
            storage
                .count_rows(table)
                .map_err(|e| format!("table {table} is not queryable: {e}"))?;
        }
        Ok(())
    }

    /// Parse the artifact without executing anything
    pub fn test_restore(&self, backup_id: &str) -> Result<RecoveryReport> {
        let options = RecoveryOptions::default()
            .dry_run()
            .without_safety_backup()
            .without_verify_after();
        self.restore(backup_id, &options)
    }

    /// Restore only the listed tables
    ///
    /// # Errors
    /// * `VaultError::Validation` - Empty list or blank table name; nothing is looked up
    pub fn restore_specific_tables(
        &self,
        backup_id: &str,
        tables: &[String],
        options: &RecoveryOptions,
    ) -> Result<RecoveryReport> {
        if tables.is_empty() {
            return Err(VaultError::validation("table list cannot be empty"));
        }
        if tables.iter().any(|table| table.trim().is_empty()) {
            return Err(VaultError::validation("table names cannot be blank"));
        }

        let options = options.clone().with_tables(tables.iter().cloned());
        self.restore(backup_id, &options)
    }

    /// Report which tables an artifact can restore
    ///
    /// Scans only as far as needed to see every table the header announces.
    pub fn analyze_coverage(&self, backup_id: &str) -> Result<CoverageReport> {
        let record = self.lookup(backup_id)?;
        let mut reader = open_artifact(&record.artifact_path)?;

        let mut first_line = String::new();
        reader.read_line(&mut first_line)?;
        let header = DumpHeader::parse(&first_line)
            .ok_or_else(|| VaultError::integrity("header marker missing from first line"))?;

        let wanted = if header.include_structure {
            StatementKind::CreateTable
        } else {
            StatementKind::Insert
        };

        let mut tables: Vec<String> = Vec::new();
        let mut complete = header.include_structure && header.table_count == 0;
        let mut scanned = 0;
        let mut statements = StatementReader::with_capture_limit(reader, COVERAGE_CAPTURE);
        while !complete && scanned < COVERAGE_SCAN_LIMIT {
            let Some(statement) = statements.next() else {
                // data-only artifacts are fully scanned
                complete = !header.include_structure;
                break;
            };
            let statement = statement?;
            scanned += 1;
            if statement.kind != wanted {
                continue;
            }
            if let Some(table) = statement.table {
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
            complete = header.include_structure && tables.len() >= header.table_count;
        }

        Ok(CoverageReport {
            backup_id: backup_id.to_string(),
            tables,
            has_data: header.include_data,
            complete,
        })
    }
}

/// Build a recovery engine (and the backup engine it wraps) from configuration
///
/// # Example
/// ```rust,no_run
/// use dbvault_core::{create_engine_from_config, DatabaseConfig, VaultConfig};
///
/// let config = VaultConfig::new(DatabaseConfig::from_uri("sqlite://app.db")?, "backups");
/// let recovery = create_engine_from_config(&config)?;
/// let backups = recovery.backup_engine().list_backups()?;
/// # Ok::<(), dbvault_core::VaultError>(())
/// ```
#[cfg(feature = "sqlite")]
pub fn create_engine_from_config(
    config: &VaultConfig,
) -> Result<RecoveryEngine<SqliteAccess, GzipCompressor>> {
    config.validate()?;
    let storage = match &config.database {
        DatabaseConfig::Sqlite { path } => Arc::new(SqliteAccess::open(path)?),
    };
    let backup = BackupEngine::new(
        storage,
        GzipCompressor::with_level(config.compression_level),
        &config.backup_dir,
    )?
    .with_retention(config.retention)
    .with_chunk_size(config.chunk_size);
    Ok(RecoveryEngine::new(Arc::new(backup)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::NoCompression;
    use crate::storage::{MockStorageAccess, SqlValue};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Mock that can produce one backup of table `t` with 3 rows
    fn source_mock() -> MockStorageAccess {
        let mut mock = MockStorageAccess::new();
        mock.expect_list_tables()
            .returning(|| Ok(vec!["t".to_string()]));
        mock.expect_create_definition()
            .returning(|_| Ok("CREATE TABLE t (id INTEGER)".to_string()));
        mock.expect_insert_columns()
            .returning(|_| Ok(vec!["id".to_string()]));
        mock.expect_fetch_page().returning(|_, offset, limit| {
            let end = (offset + limit).min(3);
            Ok((offset..end)
                .map(|i| vec![SqlValue::Integer(i as i64 + 1)])
                .collect())
        });
        mock
    }

    fn backup_with(dir: &TempDir) -> String {
        let engine = BackupEngine::new(Arc::new(source_mock()), NoCompression::new(), dir.path())
            .unwrap()
            .with_chunk_size(1);
        engine
            .create_backup(&BackupOptions::default().uncompressed())
            .unwrap()
            .id
    }

    fn recovery_with(dir: &TempDir, mock: MockStorageAccess) -> RecoveryEngine<MockStorageAccess, NoCompression> {
        let engine = BackupEngine::new(Arc::new(mock), NoCompression::new(), dir.path()).unwrap();
        RecoveryEngine::new(Arc::new(engine))
    }

    #[test]
    fn test_failed_statement_rolls_back_and_reenables_checks() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);

        let mut seq = Sequence::new();
        let mut mock = MockStorageAccess::new();
        mock.expect_set_integrity_checks()
            .with(eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_begin()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let executed = Arc::new(Mutex::new(0usize));
        let counter = executed.clone();
        // DROP, CREATE, then the first INSERT is rejected
        mock.expect_execute().returning(move |sql, _| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if sql.starts_with("INSERT") {
                Err(VaultError::storage("constraint violation"))
            } else {
                Ok(0)
            }
        });
        mock.expect_rollback()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_commit().never();
        mock.expect_set_integrity_checks()
            .with(eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let recovery = recovery_with(&dir, mock);
        let err = recovery
            .restore(&id, &RecoveryOptions::default().without_safety_backup())
            .unwrap_err();

        match err {
            VaultError::RestoreFailed { position, source } => {
                assert_eq!(position, 3);
                assert!(matches!(*source, VaultError::Execution { position: 3, .. }));
            }
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
        assert_eq!(*executed.lock().unwrap(), 3);
    }

    /// Cut the artifact of `id` just before its completion marker
    fn drop_completion_marker(dir: &TempDir, id: &str) {
        let engine = BackupEngine::new(Arc::new(MockStorageAccess::new()), NoCompression::new(), dir.path())
            .unwrap();
        let path = engine.get_backup(id).unwrap().artifact_path;
        let text = std::fs::read_to_string(&path).unwrap();
        let cut = text.find(crate::codec::COMPLETION_MARKER).unwrap();
        std::fs::write(&path, &text[..cut]).unwrap();
    }

    #[test]
    fn test_artifact_without_completion_marker_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);
        drop_completion_marker(&dir, &id);

        let mut mock = MockStorageAccess::new();
        mock.expect_set_integrity_checks().returning(|_| Ok(()));
        mock.expect_begin().times(1).returning(|| Ok(()));
        mock.expect_execute().times(5).returning(|_, _| Ok(1));
        mock.expect_rollback().times(1).returning(|| Ok(()));
        mock.expect_commit().never();

        let recovery = recovery_with(&dir, mock);
        let err = recovery
            .restore(
                &id,
                &RecoveryOptions::default()
                    .without_verify_before()
                    .without_safety_backup(),
            )
            .unwrap_err();

        match err {
            VaultError::RestoreFailed { position, source } => {
                assert_eq!(position, 6);
                assert!(matches!(*source, VaultError::Integrity(_)));
            }
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_dry_run_rejects_artifact_without_completion_marker() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);
        drop_completion_marker(&dir, &id);

        let mut mock = MockStorageAccess::new();
        mock.expect_execute().never();

        let recovery = recovery_with(&dir, mock);
        let err = recovery
            .restore(
                &id,
                &RecoveryOptions::default()
                    .dry_run()
                    .without_verify_before()
                    .without_safety_backup(),
            )
            .unwrap_err();

        assert!(matches!(err, VaultError::Integrity(_)));
    }

    #[test]
    fn test_dry_run_snapshot_does_not_evict_inspected_backup() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);

        let engine = BackupEngine::new(Arc::new(source_mock()), NoCompression::new(), dir.path())
            .unwrap()
            .with_retention(1);
        let recovery = RecoveryEngine::new(Arc::new(engine));
        let options = RecoveryOptions {
            dry_run: true,
            ..RecoveryOptions::default()
        };
        let report = recovery.restore(&id, &options).unwrap();

        let snapshot = report.safety_backup_id.unwrap();
        let backup = recovery.backup_engine();
        assert!(backup.get_backup(&id).unwrap().artifact_exists());
        assert!(backup.get_backup(&snapshot).is_ok());
        assert_eq!(backup.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);

        let mut mock = MockStorageAccess::new();
        mock.expect_execute().never();
        mock.expect_begin().never();
        mock.expect_set_integrity_checks().never();

        let recovery = recovery_with(&dir, mock);
        let report = recovery.test_restore(&id).unwrap();

        assert!(report.dry_run);
        assert!(report.safety_backup_id.is_none());
        // drop + create + 3 single-row inserts
        assert_eq!(report.statements_executed, 5);
        assert_eq!(report.tables_restored, vec!["t".to_string()]);
    }

    #[test]
    fn test_allow_list_skips_other_tables() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);

        let recovery = recovery_with(&dir, MockStorageAccess::new());
        let report = recovery
            .restore(
                &id,
                &RecoveryOptions::default()
                    .with_tables(["other"])
                    .dry_run()
                    .without_safety_backup(),
            )
            .unwrap();

        assert_eq!(report.statements_executed, 0);
        assert_eq!(report.statements_skipped, 5);
    }

    #[test]
    fn test_specific_tables_validated_before_lookup() {
        let dir = TempDir::new().unwrap();
        let recovery = recovery_with(&dir, MockStorageAccess::new());

        for tables in [vec![], vec!["t".to_string(), "  ".to_string()]] {
            let err = recovery
                .restore_specific_tables("missing-id", &tables, &RecoveryOptions::default())
                .unwrap_err();
            assert!(matches!(err, VaultError::Validation(_)));
        }
    }

    #[test]
    fn test_unknown_backup_is_not_found() {
        let dir = TempDir::new().unwrap();
        let recovery = recovery_with(&dir, MockStorageAccess::new());

        assert!(matches!(
            recovery.restore("nope", &RecoveryOptions::default()),
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(
            recovery.analyze_coverage("nope"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_post_verification_failure_is_reported_after_commit() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);

        let mut mock = MockStorageAccess::new();
        mock.expect_set_integrity_checks().returning(|_| Ok(()));
        mock.expect_begin().returning(|| Ok(()));
        mock.expect_execute().returning(|_, _| Ok(1));
        mock.expect_commit().times(1).returning(|| Ok(()));
        mock.expect_rollback().never();
        mock.expect_ping().returning(|| Ok(()));
        // the restored table is missing afterwards
        mock.expect_list_tables().returning(|| Ok(Vec::new()));

        let recovery = recovery_with(&dir, mock);
        let err = recovery
            .restore(&id, &RecoveryOptions::default().without_safety_backup())
            .unwrap_err();

        assert!(err.is_verification_only());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_coverage_reads_header_and_structure() {
        let dir = TempDir::new().unwrap();
        let id = backup_with(&dir);

        let recovery = recovery_with(&dir, MockStorageAccess::new());
        let coverage = recovery.analyze_coverage(&id).unwrap();

        assert_eq!(coverage.tables, vec!["t".to_string()]);
        assert!(coverage.has_data);
        assert!(coverage.complete);
    }
}
