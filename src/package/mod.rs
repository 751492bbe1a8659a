//! # Package Assembly
//!
//! Turns a staged tree into a `.deb`:
//!
//! 1. resolve paths, check for `DEBIAN`, drop any previous output;
//! 2. create a scratch directory that is removed on every exit path;
//! 3. tar and gzip the `DEBIAN` subtree into `control.tar.gz`;
//! 4. tar the rest of the tree into `data.tar` and compress it with the
//!    configured [`GzipCodec`] into `data.tar.gz`;
//! 5. write `debian-binary`;
//! 6. hand the three files, in order, to the [`ContainerWriter`];
//! 7. move the finished container to the output path with an atomic rename.
//!
//! Nothing is created at the output path unless every step succeeds.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{NamedTempFile, TempDir};
use tracing::{info, info_span, warn};

use crate::archive::{ArTool, ArchiverKind, ContainerMember, ContainerWriter, NativeArWriter};
use crate::common::{
    CONTROL_DIR, CONTROL_MEMBER, CONTROL_TAR, DATA_MEMBER, DATA_TAR, FORMAT_MARKER, FORMAT_MARKER_NAME,
};
use crate::compress::{self, GzipCodec, GzipOptions};
use crate::error::{display_chain, DebError, Result};
use crate::fsx;
use crate::progress::{BuildStage, ProgressCallback, ProgressTracker};
use crate::tarball::{TarArchiver, TarSummary, TreeArchiver};
use crate::workers;

const PACKAGE_FILE: &str = "package.deb";

/// Options for one package build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Compression of `data.tar`.
    pub gzip: GzipOptions,
    /// Level for `control.tar.gz`, always compressed single-threaded.
    pub control_level: u32,
    /// Delete `DEBIAN` from the staged tree once the control tarball exists.
    pub remove_control_dir: bool,
    /// Decode `data.tar.gz` again and compare it with `data.tar`.
    pub verify: bool,
    /// Record tar entries as root:root instead of the staged files' owners.
    pub root_owner: bool,
    /// Container writer used by [`PackageAssembler::from_options`].
    pub archiver: ArchiverKind,
    /// Program run for [`ArchiverKind::Ar`].
    pub ar_program: PathBuf,
    /// Parent of the per-build scratch directory; `None` uses the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            gzip: GzipOptions::default(),
            control_level: 9,
            remove_control_dir: false,
            verify: false,
            root_owner: true,
            archiver: ArchiverKind::Native,
            ar_program: PathBuf::from("ar"),
            scratch_dir: None,
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> Result<()> {
        self.gzip.validate()?;
        if self.control_level > 9 {
            return Err(DebError::InvalidOption(format!(
                "control compression level must be 0-9, got {}",
                self.control_level
            )));
        }
        Ok(())
    }
}

/// Sizes and timings of a finished build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output: PathBuf,
    pub control_gz_bytes: u64,
    pub data_tar_bytes: u64,
    pub data_gz_bytes: u64,
    pub package_bytes: u64,
    pub data_entries: TarSummary,
    pub compress_time: Duration,
    pub total_time: Duration,
}

/// Builds packages using a tar producer and a container writer.
///
/// An assembler holds no per-build state, so one instance can run several
/// builds at once from different threads; each build gets its own scratch
/// directory and worker pool.
pub struct PackageAssembler {
    archiver: Box<dyn TreeArchiver>,
    container: Box<dyn ContainerWriter>,
    progress: Option<Arc<ProgressCallback>>,
    block_encoder: BlockEncoder,
}

/// Deflates one block of `data.tar` in parallel mode.
type BlockEncoder = fn(&[u8], u32, bool) -> Result<Vec<u8>>;

impl Default for PackageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageAssembler {
    pub fn new() -> Self {
        Self {
            archiver: Box::new(TarArchiver::default()),
            container: Box::new(NativeArWriter::default()),
            progress: None,
            block_encoder: workers::deflate_block,
        }
    }

    /// An assembler whose tar producer and container writer follow `opts`.
    pub fn from_options(opts: &BuildOptions) -> Self {
        let assembler = Self::new().with_archiver(TarArchiver { root_owner: opts.root_owner, mtime: None });
        match opts.archiver {
            ArchiverKind::Native => assembler,
            ArchiverKind::Ar => assembler.with_container_writer(ArTool::new(&opts.ar_program)),
        }
    }

    pub fn with_archiver(mut self, archiver: impl TreeArchiver + 'static) -> Self {
        self.archiver = Box::new(archiver);
        self
    }

    pub fn with_container_writer(mut self, writer: impl ContainerWriter + 'static) -> Self {
        self.container = Box::new(writer);
        self
    }

    pub fn with_progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    #[cfg(test)]
    fn with_block_encoder(mut self, encoder: BlockEncoder) -> Self {
        self.block_encoder = encoder;
        self
    }

    /// Builds `output` from `staged_root`. See the module docs for the steps.
    pub fn build(&self, staged_root: &Path, output: &Path, opts: &BuildOptions) -> Result<BuildReport> {
        let started = Instant::now();
        let tracker = ProgressTracker::new(self.progress.clone());
        let span = info_span!("build", deb = %output.display());
        let _guard = span.enter();

        tracker.enter_stage(BuildStage::Prepare, 0);
        let codec = opts
            .validate()
            .and_then(|_| GzipCodec::from_options(&opts.gzip))
            .map_err(|e| e.in_stage(BuildStage::Prepare))?;
        let (root, output) = resolve_paths(staged_root, output).map_err(|e| e.in_stage(BuildStage::Prepare))?;

        let scratch_parent = opts.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
        let scratch = tempfile::Builder::new()
            .prefix("fastdeb-")
            .tempdir_in(&scratch_parent)
            .map_err(|e| DebError::io(e, &scratch_parent).in_stage(BuildStage::Prepare))?;

        let result = self.assemble(&root, &output, scratch.path(), &codec, opts, &tracker);
        let cleanup = release_scratch(scratch);
        let (mut report, pending) = match result {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(error = %display_chain(&cleanup_err), "Scratch cleanup failed after build error");
                }
                return Err(e);
            }
        };
        // The package is only renamed into place once the scratch area is gone.
        cleanup.map_err(|e| e.in_stage(BuildStage::Publish))?;
        pending
            .persist(&output)
            .map_err(|e| DebError::io(e.error, &output).in_stage(BuildStage::Publish))?;

        report.total_time = started.elapsed();
        info!(
            package_bytes = report.package_bytes,
            data_tar_bytes = report.data_tar_bytes,
            data_gz_bytes = report.data_gz_bytes,
            elapsed_ms = report.total_time.as_millis() as u64,
            "Created {}",
            report.output.display()
        );
        Ok(report)
    }

    fn assemble(
        &self,
        root: &Path,
        output: &Path,
        scratch: &Path,
        codec: &GzipCodec,
        opts: &BuildOptions,
        tracker: &ProgressTracker,
    ) -> Result<(BuildReport, NamedTempFile)> {
        // 1. Control tarball
        tracker.enter_stage(BuildStage::ControlTarball, 0);
        let control_dir = root.join(CONTROL_DIR);
        let control_gz = scratch.join(CONTROL_MEMBER);
        let control_gz_bytes = self
            .control_tarball(&control_dir, scratch, &control_gz, opts.control_level)
            .map_err(|e| e.in_stage(BuildStage::ControlTarball))?;
        if opts.remove_control_dir {
            fs::remove_dir_all(&control_dir)
                .map_err(|e| DebError::io(e, &control_dir).in_stage(BuildStage::ControlTarball))?;
            info!(dir = %control_dir.display(), "Removed control directory from staged tree");
        }

        // 2. Data tarball
        tracker.enter_stage(BuildStage::DataTarball, 0);
        info!("Creating data archive");
        let data_tar = scratch.join(DATA_TAR);
        let data_entries = write_tar(self.archiver.as_ref(), root, &[OsStr::new(CONTROL_DIR)], &data_tar)
            .map_err(|e| e.in_stage(BuildStage::DataTarball))?;
        let tar_bytes = fs::read(&data_tar).map_err(|e| DebError::io(e, &data_tar).in_stage(BuildStage::DataTarball))?;

        let data_gz = scratch.join(DATA_MEMBER);
        let compress_started = Instant::now();
        let compressed = self
            .compress_data(&tar_bytes, codec, opts.verify, tracker)
            .map_err(|e| e.in_stage(BuildStage::Compress))?;
        let compress_time = compress_started.elapsed();
        fs::write(&data_gz, &compressed).map_err(|e| DebError::io(e, &data_gz).in_stage(BuildStage::Compress))?;
        fs::remove_file(&data_tar).map_err(|e| DebError::io(e, &data_tar).in_stage(BuildStage::Compress))?;

        // 3. Format marker
        tracker.enter_stage(BuildStage::FormatMarker, 0);
        let marker = scratch.join(FORMAT_MARKER_NAME);
        fs::write(&marker, FORMAT_MARKER).map_err(|e| DebError::io(e, &marker).in_stage(BuildStage::FormatMarker))?;

        // 4. Container
        tracker.enter_stage(BuildStage::Container, 0);
        info!(writer = self.container.name(), "Creating ar archive");
        let package = scratch.join(PACKAGE_FILE);
        let members = [marker, control_gz, data_gz]
            .into_iter()
            .map(ContainerMember::from_path)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.in_stage(BuildStage::Container))?;
        self.container
            .write_container(&package, &members)
            .map_err(|e| e.in_stage(BuildStage::Container))?;

        // 5. Publish
        tracker.enter_stage(BuildStage::Publish, 0);
        let (pending, package_bytes) = stage_output(&package, output).map_err(|e| e.in_stage(BuildStage::Publish))?;

        let report = BuildReport {
            output: output.to_path_buf(),
            control_gz_bytes,
            data_tar_bytes: tar_bytes.len() as u64,
            data_gz_bytes: compressed.len() as u64,
            package_bytes,
            data_entries,
            compress_time,
            total_time: Duration::ZERO,
        };
        Ok((report, pending))
    }

    fn control_tarball(&self, control_dir: &Path, scratch: &Path, control_gz: &Path, level: u32) -> Result<u64> {
        let control_tar = scratch.join(CONTROL_TAR);
        write_tar(self.archiver.as_ref(), control_dir, &[], &control_tar)?;
        let tar_bytes = fs::read(&control_tar).map_err(|e| DebError::io(e, &control_tar))?;
        let gz = GzipCodec::SingleThreaded { level }.compress(&tar_bytes)?;
        fs::write(control_gz, &gz).map_err(|e| DebError::io(e, control_gz))?;
        fs::remove_file(&control_tar).map_err(|e| DebError::io(e, &control_tar))?;
        Ok(gz.len() as u64)
    }

    fn compress_data(&self, tar_bytes: &[u8], codec: &GzipCodec, verify: bool, tracker: &ProgressTracker) -> Result<Vec<u8>> {
        match codec {
            GzipCodec::SingleThreaded { level } => {
                info!(level, bytes = tar_bytes.len(), "Compressing data.tar single-threaded");
            }
            GzipCodec::Parallel { level, workers, block_size } => {
                info!(
                    level,
                    workers,
                    block_kb = block_size / 1024,
                    bytes = tar_bytes.len(),
                    "Compressing data.tar in parallel"
                );
            }
        }
        let compressed = match *codec {
            GzipCodec::Parallel { level, workers, block_size } => {
                workers::compress_blocks_with(tar_bytes, level, workers, block_size, tracker, self.block_encoder)?
            }
            GzipCodec::SingleThreaded { .. } => codec.compress_with_progress(tar_bytes, tracker)?,
        };
        if verify {
            let decoded = compress::verify_gzip(&compressed, tar_bytes)?;
            info!(decoded, "Verified data.tar.gz");
        }
        Ok(compressed)
    }
}

/// Builds a package with the tar producer and container writer selected by `opts`.
pub fn build(staged_root: &Path, output: &Path, opts: &BuildOptions) -> Result<BuildReport> {
    PackageAssembler::from_options(opts).build(staged_root, output, opts)
}

/// Absolute staged root and output path. Fails on a missing `DEBIAN` before
/// the output path is touched; otherwise removes a previous output file.
fn resolve_paths(staged_root: &Path, output: &Path) -> Result<(PathBuf, PathBuf)> {
    let root = fs::canonicalize(staged_root).map_err(|e| DebError::Unreadable {
        source: e,
        path: staged_root.to_path_buf(),
    })?;
    if !root.join(CONTROL_DIR).is_dir() {
        return Err(DebError::MissingControlDir { root });
    }

    let output = fsx::absolutize(output).map_err(|e| DebError::io(e, output))?;
    let parent = output.parent().unwrap_or_else(|| Path::new("/"));
    if !parent.is_dir() {
        return Err(DebError::io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "output directory does not exist"),
            parent,
        ));
    }
    if output.starts_with(&root) {
        return Err(DebError::InvalidOption(format!(
            "output '{}' lies inside the staged tree",
            output.display()
        )));
    }
    if fsx::remove_file_if_exists(&output).map_err(|e| DebError::io(e, &output))? {
        info!(path = %output.display(), "Removed existing package");
    }
    Ok((root, output))
}

fn write_tar(archiver: &dyn TreeArchiver, root: &Path, exclude: &[&OsStr], dest: &Path) -> Result<TarSummary> {
    let file = File::create(dest).map_err(|e| DebError::io(e, dest))?;
    let mut out = BufWriter::new(file);
    let summary = archiver.archive(root, exclude, &mut out)?;
    out.flush().map_err(|e| DebError::io(e, dest))?;
    Ok(summary)
}

/// Copies the finished container to a temporary file next to `output`. The
/// caller renames it into place; dropping it deletes the copy.
fn stage_output(package: &Path, output: &Path) -> Result<(NamedTempFile, u64)> {
    let dir = output.parent().unwrap_or_else(|| Path::new("/"));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| DebError::io(e, dir))?;
    let mut src = File::open(package).map_err(|e| DebError::io(e, package))?;
    let bytes = std::io::copy(&mut src, tmp.as_file_mut()).map_err(|e| DebError::io(e, tmp.path().to_path_buf()))?;
    tmp.as_file().sync_all().map_err(|e| DebError::io(e, tmp.path().to_path_buf()))?;
    fsx::set_unix_permissions(tmp.path(), 0o644).map_err(|e| DebError::io(e, tmp.path().to_path_buf()))?;
    Ok((tmp, bytes))
}

fn release_scratch(scratch: TempDir) -> Result<()> {
    let path = scratch.path().to_path_buf();
    scratch.close().map_err(|e| DebError::io(e, path))
}
