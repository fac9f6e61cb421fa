/*!
Backup record metadata and the options a backup was produced with.
*/

use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Current artifact/record format version for compatibility tracking
pub const FORMAT_VERSION: u8 = 1;

/// Options controlling what a backup run captures
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    /// Emit a drop + create pair for every table
    pub include_structure: bool,

    /// Emit batched inserts for every table's rows
    pub include_data: bool,

    /// Re-encode the finished dump through the engine's compressor
    pub compress: bool,

    /// Run the integrity verifier against the final artifact
    pub verify: bool,

    /// Free-text description shown in listings
    #[serde(default)]
    pub description: String,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_structure: true,
            include_data: true,
            compress: true,
            verify: true,
            description: String::new(),
        }
    }
}

impl BackupOptions {
    /// Set the free-text description
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Skip the structure section
    pub fn without_structure(mut self) -> Self {
        self.include_structure = false;
        self
    }

    /// Skip the data section
    pub fn without_data(mut self) -> Self {
        self.include_data = false;
        self
    }

    /// Write a plain-text artifact
    pub fn uncompressed(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Skip post-write verification
    pub fn unverified(mut self) -> Self {
        self.verify = false;
        self
    }

    /// Validate that at least one section is requested
    pub fn validate(&self) -> Result<()> {
        if !self.include_structure && !self.include_data {
            return Err(VaultError::validation(
                "a backup must include structure, data, or both",
            ));
        }
        Ok(())
    }
}

/// Metadata for one completed backup run
///
/// Records are created at the end of a successful run and never modified
/// afterwards; the catalog owns them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupRecord {
    /// Time-ordered unique identifier (UUIDv7)
    pub id: String,

    /// Location of the final artifact
    pub artifact_path: PathBuf,

    /// Size of the final artifact in bytes
    pub size_bytes: u64,

    /// When the run started
    pub created_at: DateTime<Utc>,

    /// Wall-clock duration of the run
    pub duration_ms: u64,

    /// Number of tables captured
    pub table_count: usize,

    /// Number of rows written to the data section
    pub row_count: u64,

    /// Number of batched insert statements written
    pub chunk_count: u64,

    /// SHA-256 of the final artifact bytes
    pub checksum: String,

    /// Compression algorithm of the final artifact
    pub compression_algorithm: String,

    /// Format version (current: 1)
    pub format_version: u8,

    /// Options used to produce the artifact
    pub options: BackupOptions,
}

impl BackupRecord {
    /// Generate a new time-ordered backup identifier
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Suggested artifact file name for a run started at `created_at`
    ///
    /// Format: backup_{timestamp}_{id suffix}.{extension}
    pub fn suggested_filename(id: &str, created_at: DateTime<Utc>, extension: &str) -> String {
        let timestamp = created_at.format("%Y%m%d_%H%M%S");
        let suffix: String = id
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .rev()
            .take(12)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("backup_{timestamp}_{suffix}.{extension}")
    }

    /// Compute the SHA-256 hash of the provided data
    ///
    /// # Returns
    /// Hexadecimal string representation of the SHA-256 hash
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Compute the SHA-256 hash of a file without loading it into memory
    pub fn compute_file_hash<P: AsRef<Path>>(path: P) -> Result<String> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verify the artifact on disk against the stored checksum
    ///
    /// # Returns
    /// Ok(()) if the hash matches, Err(VaultError::IntegrityCheckFailed) otherwise
    pub fn verify_integrity(&self) -> Result<()> {
        let computed = Self::compute_file_hash(&self.artifact_path)?;
        if computed == self.checksum {
            Ok(())
        } else {
            Err(VaultError::IntegrityCheckFailed {
                expected: self.checksum.clone(),
                actual: computed,
            })
        }
    }

    /// Validate that all required fields are properly set
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(VaultError::validation("id cannot be empty"));
        }
        if self.checksum.is_empty() {
            return Err(VaultError::validation("checksum cannot be empty"));
        }
        if self.artifact_path.as_os_str().is_empty() {
            return Err(VaultError::validation("artifact_path cannot be empty"));
        }
        Ok(())
    }

    /// Check if this record is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= FORMAT_VERSION
    }

    /// True when the artifact file is still present
    pub fn artifact_exists(&self) -> bool {
        self.artifact_path.is_file()
    }
}
