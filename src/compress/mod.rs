//! # Gzip Compression
//!
//! Produces gzip streams that any standard single-pass decoder accepts, through
//! one of two strategies:
//!
//! - **Single-threaded**: one deflate stream over the whole input via `flate2`.
//!   This is the reference path and is used for the small control tarball.
//! - **Parallel**: the input is cut into fixed-size blocks which are deflated
//!   independently by a worker pool (see [`crate::workers`]) and stitched into a
//!   single gzip member whose trailer covers the whole input.
//!
//! Both strategies honour the same zlib level, so their ratios stay comparable.

pub mod gzip;

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tempfile::NamedTempFile;
use tracing::info;

pub use crate::cli::CompressionMode;
use crate::common::{default_workers, DEFAULT_BLOCK_SIZE_KB, DEFAULT_LEVEL};
use crate::error::{DebError, Result};
use crate::progress::{BuildStage, ProgressTracker};
use crate::workers;

/// Holds all configuration options for a gzip compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipOptions {
    /// zlib level, 0 (store) to 9 (best).
    pub level: u32,
    pub mode: CompressionMode,
    /// Upper bound on compression threads; 0 means one per CPU.
    pub workers: usize,
    /// Parallel block size in KiB. The last block may be shorter.
    pub block_size_kb: usize,
}

impl Default for GzipOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            mode: CompressionMode::Parallel,
            workers: 0,
            block_size_kb: DEFAULT_BLOCK_SIZE_KB,
        }
    }
}

impl GzipOptions {
    pub fn single_threaded(level: u32) -> Self {
        Self { level, mode: CompressionMode::SingleThreaded, ..Self::default() }
    }

    pub fn parallel(level: u32, workers: usize, block_size_kb: usize) -> Self {
        Self { level, mode: CompressionMode::Parallel, workers, block_size_kb }
    }

    pub fn validate(&self) -> Result<()> {
        if self.level > 9 {
            return Err(DebError::InvalidOption(format!(
                "compression level must be 0-9, got {}",
                self.level
            )));
        }
        if self.block_size_kb == 0 {
            return Err(DebError::InvalidOption("block size must be at least 1 KiB".into()));
        }
        self.block_size_kb
            .checked_mul(1024)
            .ok_or_else(|| DebError::InvalidOption(format!("block size {} KiB is too large", self.block_size_kb)))?;
        Ok(())
    }

    /// Worker count with 0 resolved to the hardware concurrency.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        }
    }

    pub fn block_size_bytes(&self) -> usize {
        self.block_size_kb.saturating_mul(1024)
    }
}

/// A configured compression strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GzipCodec {
    SingleThreaded { level: u32 },
    Parallel { level: u32, workers: usize, block_size: usize },
}

impl GzipCodec {
    pub fn from_options(opts: &GzipOptions) -> Result<Self> {
        opts.validate()?;
        Ok(match opts.mode {
            CompressionMode::SingleThreaded => GzipCodec::SingleThreaded { level: opts.level },
            CompressionMode::Parallel => GzipCodec::Parallel {
                level: opts.level,
                workers: opts.effective_workers(),
                block_size: opts.block_size_bytes(),
            },
        })
    }

    pub fn level(&self) -> u32 {
        match *self {
            GzipCodec::SingleThreaded { level } | GzipCodec::Parallel { level, .. } => level,
        }
    }

    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        self.compress_with_progress(input, &ProgressTracker::disabled())
    }

    /// Compresses `input` into a complete gzip stream. The output is only
    /// returned once every block has been produced.
    pub fn compress_with_progress(&self, input: &[u8], tracker: &ProgressTracker) -> Result<Vec<u8>> {
        match *self {
            GzipCodec::SingleThreaded { level } => {
                tracker.enter_stage(BuildStage::Compress, 1);
                let out = compress_single(input, level)?;
                tracker.record_block(input.len() as u64, out.len() as u64);
                Ok(out)
            }
            GzipCodec::Parallel { level, workers, block_size } => {
                workers::compress_parallel(input, level, workers, block_size, tracker)
            }
        }
    }
}

fn compress_single(input: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzBuilder::new().write(
        Vec::with_capacity(input.len() / 2 + 64),
        Compression::new(level),
    );
    encoder
        .write_all(input)
        .map_err(|e| DebError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| DebError::Compression(e.to_string()))
}

/// Compresses `input` with the strategy described by `opts`.
pub fn compress(input: &[u8], opts: &GzipOptions) -> Result<Vec<u8>> {
    GzipCodec::from_options(opts)?.compress(input)
}

/// Decodes `gz` with a standard single-pass decoder and checks it reproduces
/// `expected`. Returns the decompressed length.
pub fn verify_gzip(gz: &[u8], expected: &[u8]) -> Result<u64> {
    let mut decoded = Vec::with_capacity(expected.len());
    GzDecoder::new(gz)
        .read_to_end(&mut decoded)
        .map_err(|e| DebError::Compression(format!("output does not decode: {e}")))?;
    if decoded.len() != expected.len() {
        return Err(DebError::Compression(format!(
            "decoded {} bytes, expected {}",
            decoded.len(),
            expected.len()
        )));
    }
    if crc32fast::hash(&decoded) != crc32fast::hash(expected) {
        return Err(DebError::Compression("decoded content does not match input".into()));
    }
    Ok(decoded.len() as u64)
}

/// Length of the content of a gzip stream, read through a standard decoder.
pub fn decoded_len(gz: impl Read) -> Result<u64> {
    std::io::copy(&mut GzDecoder::new(gz), &mut std::io::sink())
        .map_err(|e| DebError::Compression(format!("output does not decode: {e}")))
}

/// Compresses the file at `path` into `path.gz`, replacing any existing file.
///
/// The output is written to a temporary file next to the target and renamed
/// into place, so a failure never leaves a truncated `.gz` behind.
pub fn compress_file(path: &Path, opts: &GzipOptions) -> Result<PathBuf> {
    let codec = GzipCodec::from_options(opts)?;
    let (workers, block_kb) = match codec {
        GzipCodec::SingleThreaded { .. } => (1, 0),
        GzipCodec::Parallel { workers, block_size, .. } => (workers, block_size / 1024),
    };
    info!(
        path = %path.display(),
        level = codec.level(),
        mode = ?opts.mode,
        workers,
        block_kb,
        "Compressing"
    );

    let input = fs::read(path).map_err(|e| DebError::io(e, path))?;
    let started = Instant::now();
    let compressed = codec.compress(&input)?;
    let elapsed = started.elapsed();

    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);
    let dir = gz_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| DebError::io(e, dir))?;
    tmp.write_all(&compressed).map_err(|e| DebError::io(e, tmp.path().to_path_buf()))?;
    tmp.persist(&gz_path).map_err(|e| DebError::io(e.error, &gz_path))?;

    let decoded = decoded_len(compressed.as_slice())?;
    let secs = elapsed.as_secs_f64();
    let mbps = if secs > 0.0 { input.len() as f64 / (1024.0 * 1024.0) / secs } else { 0.0 };
    info!(
        compressed = compressed.len(),
        decompressed = decoded,
        elapsed_ms = elapsed.as_millis() as u64,
        mbps = %format!("{mbps:.1}"),
        "Compressed {}",
        gz_path.display()
    );
    Ok(gz_path)
}
