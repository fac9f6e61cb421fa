/*!
Error types for the dbvault core engine.
*/

use thiserror::Error;

/// Result type used throughout the dbvault core.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors that can occur during backup, verification and recovery.
#[derive(Error, Debug)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors (catalog, schedule, config)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Checksum mismatch between the catalog and the artifact on disk
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Structural problems with an artifact (missing markers, wrong table count)
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Malformed statement stream
    #[error("Codec error at statement {position}: {message}")]
    Codec { position: usize, message: String },

    /// A statement was rejected by the database
    #[error("Execution error at statement {position}: {message}")]
    Execution { position: usize, message: String },

    /// Unknown backup id or missing artifact
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad caller input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage access (database) errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation lock could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// A backup run aborted; nothing was cataloged
    #[error("Backup failed: {source}")]
    BackupFailed {
        #[source]
        source: Box<VaultError>,
    },

    /// A restore aborted and its transaction was rolled back
    #[error("Restore failed at statement {position} (rolled back): {source}")]
    RestoreFailed {
        position: usize,
        #[source]
        source: Box<VaultError>,
    },

    /// Post-restore sanity check failed; the restore is already committed
    #[error("Post-restore verification failed: {0}")]
    VerificationFailed(String),
}

impl VaultError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity<S: Into<String>>(msg: S) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new codec error for the statement at `position`
    pub fn codec<S: Into<String>>(position: usize, msg: S) -> Self {
        Self::Codec {
            position,
            message: msg.into(),
        }
    }

    /// Wrap a failure that aborted a backup run
    pub fn backup_failed(source: VaultError) -> Self {
        match source {
            already @ Self::BackupFailed { .. } => already,
            other => Self::BackupFailed {
                source: Box::new(other),
            },
        }
    }

    /// Wrap a replay failure that caused a rollback
    pub fn restore_failed(position: usize, source: VaultError) -> Self {
        Self::RestoreFailed {
            position,
            source: Box::new(source),
        }
    }

    /// True for failures that happened after data was committed
    pub fn is_verification_only(&self) -> bool {
        matches!(self, Self::VerificationFailed(_))
    }

    /// Process exit status for the operational surface
    ///
    /// `0` success, `2` verification-only failure, `1` everything else.
    pub fn exit_code(&self) -> i32 {
        if self.is_verification_only() {
            2
        } else {
            1
        }
    }
}
