//! Progress reporting for package builds.
//!
//! The assembler and the block compressor push [`ProgressState`] snapshots to an
//! optional callback. Nothing is emitted when no callback is installed, so the
//! tracker costs a few atomic increments per block at most.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The step of a package build that is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStage {
    /// Resolving paths and checking the staged tree.
    Prepare,
    /// Archiving and compressing the `DEBIAN` subtree.
    ControlTarball,
    /// Archiving the installable files.
    DataTarball,
    /// Compressing `data.tar`.
    Compress,
    /// Writing the `debian-binary` marker.
    FormatMarker,
    /// Writing the ar container.
    Container,
    /// Moving the finished package to its final path.
    Publish,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Prepare => "prepare",
            BuildStage::ControlTarball => "control tarball",
            BuildStage::DataTarball => "data tarball",
            BuildStage::Compress => "compress",
            BuildStage::FormatMarker => "format marker",
            BuildStage::Container => "container",
            BuildStage::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub stage: BuildStage,
    pub completed_blocks: u64,
    pub total_blocks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_time: Duration,
}

impl ProgressState {
    /// Percentage of compression blocks done; stages without blocks report 100.
    pub fn progress_percent(&self) -> f32 {
        if self.total_blocks == 0 {
            return 100.0;
        }
        (self.completed_blocks as f32 / self.total_blocks as f32) * 100.0
    }

    /// Input throughput in MiB/s since the tracker was started.
    pub fn speed_mbps(&self) -> f32 {
        let secs = self.elapsed_time.as_secs_f32();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.bytes_in as f32 / (1024.0 * 1024.0)) / secs
    }
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(ProgressState) + Send + Sync;

/// Shared between the worker pool and the collector; every method is callable from any thread.
pub struct ProgressTracker {
    callback: Option<Arc<ProgressCallback>>,
    stage: Mutex<BuildStage>,
    completed_blocks: AtomicU64,
    total_blocks: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(callback: Option<Arc<ProgressCallback>>) -> Self {
        Self {
            callback,
            stage: Mutex::new(BuildStage::Prepare),
            completed_blocks: AtomicU64::new(0),
            total_blocks: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// A tracker that never reports anything.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Switches to `stage`, resetting the block counters.
    pub fn enter_stage(&self, stage: BuildStage, total_blocks: u64) {
        if let Ok(mut current) = self.stage.lock() {
            *current = stage;
        }
        self.completed_blocks.store(0, Ordering::Relaxed);
        self.total_blocks.store(total_blocks, Ordering::Relaxed);
        self.emit();
    }

    /// Records one finished compression block.
    pub fn record_block(&self, bytes_in: u64, bytes_out: u64) {
        self.completed_blocks.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.emit();
    }

    pub fn snapshot(&self) -> ProgressState {
        let stage = self.stage.lock().map(|s| *s).unwrap_or(BuildStage::Prepare);
        ProgressState {
            stage,
            completed_blocks: self.completed_blocks.load(Ordering::Relaxed),
            total_blocks: self.total_blocks.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            elapsed_time: self.start_time.elapsed(),
        }
    }

    fn emit(&self) {
        if let Some(cb) = &self.callback {
            cb(self.snapshot());
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::disabled()
    }
}
