/*!
Compression adapters for dump artifacts.

Artifacts are compressed in a single streaming pass after the plain dump has
been written, and decompressed on the fly when they are read back. The default
implementation uses gzip; readers detect gzip by its magic bytes so callers
never need to know how an artifact was written.
*/

use crate::{Result, VaultError};
use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

/// Magic bytes at the start of every gzip member
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Streaming compression abstraction for dump artifacts
///
/// This trait lets the backup engine work with different compression
/// algorithms without being coupled to any specific implementation.
pub trait CompressionAdapter: Send + Sync {
    /// Compress everything readable from `input` into `output`
    ///
    /// # Returns
    /// The number of uncompressed bytes consumed
    fn compress_stream(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64>;

    /// Wrap a reader of compressed bytes into a reader of plain bytes
    fn decompress_stream<'a>(&self, input: Box<dyn Read + 'a>) -> Box<dyn Read + 'a>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;

    /// File extension used for artifacts written by this adapter
    fn file_extension(&self) -> &str;
}

/// Gzip compression adapter
///
/// Uses DEFLATE (gzip), a good balance of compression ratio and speed for
/// SQL text, which compresses very well.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Create a compressor for maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress_stream(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let mut encoder = GzEncoder::new(output, self.compression_level);

        let copied = io::copy(input, &mut encoder).map_err(|e| {
            VaultError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| VaultError::compression(format!("Failed to finish compression: {e}")))?
            .flush()?;

        Ok(copied)
    }

    fn decompress_stream<'a>(&self, input: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        Box::new(MultiGzDecoder::new(input))
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }

    fn file_extension(&self) -> &str {
        "sql.gz"
    }
}

/// No-compression adapter for plain-text artifacts
#[derive(Debug, Clone)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoCompression {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for NoCompression {
    fn compress_stream(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        let copied = io::copy(input, output)?;
        output.flush()?;
        Ok(copied)
    }

    fn decompress_stream<'a>(&self, input: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        input
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }

    fn file_extension(&self) -> &str {
        "sql"
    }
}

/// Open an artifact for reading, decompressing on the fly when it is gzip
pub fn open_artifact<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if is_gzip {
        let plain = GzipCompressor::new().decompress_stream(Box::new(reader));
        Ok(Box::new(BufReader::new(plain)))
    } else {
        Ok(Box::new(reader))
    }
}

/// True when the file at `path` starts with the gzip magic bytes
pub fn is_compressed<P: AsRef<Path>>(path: P) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path.as_ref())?;
    let read = file.read(&mut magic)?;
    Ok(read == 2 && magic == GZIP_MAGIC)
}
