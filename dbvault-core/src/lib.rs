/*!
# dbvault Core Engine

Database backup, verification and recovery core library.

This crate provides the foundational functionality for capturing a database
into portable, replayable dump artifacts and restoring from them safely:

- Hexagonal architecture with pluggable storage access and compression adapters
- Chunked, streaming dumps with bounded memory use
- Integrity verification (header and completion markers, structure count, SHA-256)
- Transactional restore with rollback, safety snapshots and dry runs
- A persistent catalog with retention and audit

## Architecture

The core follows hexagonal architecture principles:
- Domain logic is isolated from infrastructure concerns
- Database access and compression are implemented as adapters
- Easy to extend with new database backends or compression algorithms

## Usage

```rust,no_run
use std::sync::Arc;
use dbvault_core::{BackupEngine, BackupOptions, GzipCompressor, RecoveryEngine, RecoveryOptions};
use dbvault_core::storage::sqlite::SqliteAccess;

let db = Arc::new(SqliteAccess::open("app.db")?);
let backups = Arc::new(BackupEngine::new(db, GzipCompressor::new(), "backups")?);
let recovery = RecoveryEngine::new(backups.clone());

// Take a backup
let record = backups.create_backup(&BackupOptions::default().with_description("before upgrade"))?;

// Restore it, with a safety snapshot of the current state first
let report = recovery.restore(&record.id, &RecoveryOptions::default())?;
assert!(report.success);
# Ok::<(), dbvault_core::VaultError>(())
```
*/

pub mod backup;
pub mod catalog;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod observability;
pub mod recovery;
pub mod scheduler;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod error_tests;

pub use backup::BackupEngine;
pub use catalog::{AuditEntry, Catalog};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{DatabaseConfig, VaultConfig};
pub use error::{Result, VaultError};
pub use lock::OperationLock;
pub use metadata::{BackupOptions, BackupRecord};
#[cfg(feature = "sqlite")]
pub use recovery::create_engine_from_config;
pub use recovery::{CoverageReport, RecoveryEngine, RecoveryOptions, RecoveryReport};
pub use scheduler::{ScheduleState, Scheduler};
pub use storage::{Row, SqlValue, StorageAccess};
pub use verify::{
    compute_checksum, verify_artifact, VerificationExpectations, VerificationFailure,
    VerificationReport,
};
