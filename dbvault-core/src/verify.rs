/*!
Integrity verification for dump artifacts.

Verification only reads the artifact. Failed checks are reported in the
[`VerificationReport`]; only hard I/O failures (for example an artifact that
cannot be opened) surface as errors.
*/

use crate::codec::{StatementKind, StatementReader, HEADER_MARKER};
use crate::compression::open_artifact;
use crate::metadata::BackupRecord;
use crate::{Result, VaultError};
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use tracing::debug;

/// Bytes of each statement kept while scanning; enough to classify it
const SCAN_CAPTURE: usize = 256;

/// Reference values an artifact is checked against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationExpectations {
    /// Number of structure definitions the artifact must contain
    pub table_count: Option<usize>,
    /// SHA-256 of the artifact bytes
    pub checksum: Option<String>,
}

impl VerificationExpectations {
    /// Expectations derived from a cataloged record
    pub fn for_record(record: &BackupRecord) -> Self {
        Self {
            table_count: record
                .options
                .include_structure
                .then_some(record.table_count),
            checksum: Some(record.checksum.clone()),
        }
    }

    pub fn with_table_count(mut self, count: usize) -> Self {
        self.table_count = Some(count);
        self
    }

    pub fn with_checksum<S: Into<String>>(mut self, checksum: S) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// The first check an artifact failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    Empty,
    MissingHeader,
    Truncated,
    Malformed(String),
    TableCount { expected: usize, actual: usize },
    Checksum { expected: String, actual: String },
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "artifact is empty"),
            Self::MissingHeader => write!(f, "header marker missing from first line"),
            Self::Truncated => write!(f, "completion marker missing (artifact truncated?)"),
            Self::Malformed(reason) => write!(f, "artifact unreadable: {reason}"),
            Self::TableCount { expected, actual } => write!(
                f,
                "expected {expected} structure definitions, found {actual}"
            ),
            Self::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

/// Outcome of verifying one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub passed: bool,
    pub failure: Option<VerificationFailure>,
    /// SHA-256 of the artifact bytes as found on disk
    pub checksum: String,
    /// Structure definitions found before the scan stopped
    pub structure_count: usize,
}

impl VerificationReport {
    /// Human-readable reason for a failed report
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    /// Map a failed report onto the matching error
    pub fn into_result(self) -> Result<Self> {
        match self.failure {
            None => Ok(self),
            Some(VerificationFailure::Checksum { expected, actual }) => {
                Err(VaultError::IntegrityCheckFailed { expected, actual })
            }
            Some(other) => Err(VaultError::integrity(other.to_string())),
        }
    }
}

/// Stable SHA-256 checksum of the artifact bytes
pub fn compute_checksum<P: AsRef<Path>>(path: P) -> Result<String> {
    BackupRecord::compute_file_hash(path)
}

/// Check an artifact against its expected shape and checksum
pub fn verify_artifact<P: AsRef<Path>>(
    path: P,
    expectations: &VerificationExpectations,
) -> Result<VerificationReport> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    let checksum = compute_checksum(path)?;

    let mut report = VerificationReport {
        passed: false,
        failure: None,
        checksum,
        structure_count: 0,
    };

    if size == 0 {
        report.failure = Some(VerificationFailure::Empty);
        return Ok(report);
    }

    let mut reader = open_artifact(path)?;
    if let Err(failure) = scan_content(reader.as_mut(), &mut report.structure_count) {
        report.failure = Some(failure);
        return Ok(report);
    }

    if let Some(expected) = expectations.table_count {
        if expected != report.structure_count {
            report.failure = Some(VerificationFailure::TableCount {
                expected,
                actual: report.structure_count,
            });
            return Ok(report);
        }
    }

    if let Some(expected) = &expectations.checksum {
        if *expected != report.checksum {
            report.failure = Some(VerificationFailure::Checksum {
                expected: expected.clone(),
                actual: report.checksum.clone(),
            });
            return Ok(report);
        }
    }

    debug!(
        "Verified {} ({} structure definitions)",
        path.display(),
        report.structure_count
    );
    report.passed = true;
    Ok(report)
}

fn scan_content(
    reader: &mut dyn BufRead,
    structure_count: &mut usize,
) -> std::result::Result<(), VerificationFailure> {
    let mut first_line = String::new();
    reader
        .read_line(&mut first_line)
        .map_err(|e| VerificationFailure::Malformed(e.to_string()))?;
    if !first_line.starts_with(HEADER_MARKER) {
        return Err(VerificationFailure::MissingHeader);
    }

    let mut statements = StatementReader::with_capture_limit(reader, SCAN_CAPTURE);
    for statement in statements.by_ref() {
        let statement = statement.map_err(|e| VerificationFailure::Malformed(e.to_string()))?;
        if statement.kind == StatementKind::CreateTable {
            *structure_count += 1;
        }
    }

    if statements.saw_completion_marker() {
        Ok(())
    } else {
        Err(VerificationFailure::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DumpHeader, DumpWriter};
    use crate::compression::{CompressionAdapter, GzipCompressor};
    use crate::storage::SqlValue;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_dump(dir: &TempDir, name: &str, tables: &[&str]) -> PathBuf {
        let header = DumpHeader {
            table_count: tables.len(),
            include_structure: true,
            include_data: true,
            compress: false,
            created_at: Utc::now(),
            description: "test".to_string(),
        };
        let mut writer = DumpWriter::new(Vec::new());
        writer.write_header(&header).unwrap();
        for table in tables {
            writer
                .write_structure(table, &format!("CREATE TABLE {table} (id INTEGER, v TEXT)"))
                .unwrap();
            writer.begin_data(table, &[]).unwrap();
            writer
                .write_rows(table, &[vec![SqlValue::Integer(1), SqlValue::Text("x".into())]])
                .unwrap();
        }
        writer.write_footer().unwrap();

        let path = dir.path().join(name);
        fs::write(&path, writer.into_inner().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_well_formed_artifact_passes() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(&dir, "ok.sql", &["a", "b"]);
        let checksum = compute_checksum(&path).unwrap();

        let expectations = VerificationExpectations::default()
            .with_table_count(2)
            .with_checksum(checksum.clone());
        let report = verify_artifact(&path, &expectations).unwrap();

        assert!(report.passed, "{:?}", report.reason());
        assert_eq!(report.structure_count, 2);
        assert_eq!(report.checksum, checksum);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_verification_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(&dir, "ok.sql", &["a"]);

        let first = verify_artifact(&path, &VerificationExpectations::default()).unwrap();
        let second = verify_artifact(&path, &VerificationExpectations::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_compressed_artifact_passes() {
        let dir = TempDir::new().unwrap();
        let plain = write_dump(&dir, "plain.sql", &["a"]);
        let gz = dir.path().join("dump.sql.gz");
        GzipCompressor::new()
            .compress_stream(
                &mut fs::File::open(&plain).unwrap(),
                &mut fs::File::create(&gz).unwrap(),
            )
            .unwrap();

        let report = verify_artifact(&gz, &VerificationExpectations::default().with_table_count(1)).unwrap();
        assert!(report.passed, "{:?}", report.reason());
    }

    #[test]
    fn test_empty_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sql");
        fs::write(&path, b"").unwrap();

        let report = verify_artifact(&path, &VerificationExpectations::default()).unwrap();
        assert_eq!(report.failure, Some(VerificationFailure::Empty));
    }

    #[test]
    fn test_missing_header_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foreign.sql");
        fs::write(&path, b"CREATE TABLE t (a);\n-- DBVAULT DUMP COMPLETE\n").unwrap();

        let report = verify_artifact(&path, &VerificationExpectations::default()).unwrap();
        assert_eq!(report.failure, Some(VerificationFailure::MissingHeader));
        assert!(matches!(report.into_result(), Err(VaultError::Integrity(_))));
    }

    #[test]
    fn test_truncated_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(&dir, "cut.sql", &["a"]);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 50]).unwrap();

        let report = verify_artifact(&path, &VerificationExpectations::default()).unwrap();
        assert!(!report.passed);
        assert!(matches!(
            report.failure,
            Some(VerificationFailure::Truncated | VerificationFailure::Malformed(_))
        ));
    }

    #[test]
    fn test_table_count_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(&dir, "two.sql", &["a", "b"]);

        let report =
            verify_artifact(&path, &VerificationExpectations::default().with_table_count(3)).unwrap();
        assert_eq!(
            report.failure,
            Some(VerificationFailure::TableCount { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_single_byte_change_alters_checksum() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(&dir, "flip.sql", &["a"]);
        let original = compute_checksum(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let at = bytes.iter().rposition(|&b| b == b'x').unwrap();
        bytes[at] = b'y';
        fs::write(&path, bytes).unwrap();

        let report =
            verify_artifact(&path, &VerificationExpectations::default().with_checksum(original)).unwrap();
        assert!(matches!(report.failure, Some(VerificationFailure::Checksum { .. })));
        assert!(matches!(
            report.into_result(),
            Err(VaultError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_missing_artifact_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = verify_artifact(dir.path().join("nope.sql"), &VerificationExpectations::default());
        assert!(matches!(result, Err(VaultError::Io(_))));
    }
}
