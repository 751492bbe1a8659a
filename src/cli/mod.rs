use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::common::{DEFAULT_BLOCK_SIZE_KB, DEFAULT_LEVEL};
use crate::compress::GzipOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase log verbosity (-v for debug, -vv for trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build a .deb package from a staged directory tree.
    #[command(alias = "b")]
    Build {
        /// Staged tree: the installed layout plus a DEBIAN control directory.
        #[arg(long = "build", value_name = "DIR")]
        build_root: PathBuf,

        /// Path of the .deb file to create. An existing file is replaced.
        #[arg(long, value_name = "FILE")]
        deb: PathBuf,

        #[command(flatten)]
        gzip: GzipArgs,

        /// How the ar container is written.
        #[arg(long, value_enum, default_value_t = ArchiverKind::Native)]
        archiver: ArchiverKind,

        /// Program used with `--archiver ar`.
        #[arg(long, default_value = "ar")]
        ar_program: PathBuf,

        /// Delete the DEBIAN directory from the staged tree once the control tarball is written.
        #[arg(long)]
        remove_control_dir: bool,

        /// Keep the staged files' owners in the tarballs instead of root:root.
        #[arg(long)]
        keep_owner: bool,

        /// Decode data.tar.gz after compressing it and check length and CRC-32.
        #[arg(long)]
        verify: bool,

        /// Show a progress line on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// Compress a single file to FILE.gz and report throughput.
    #[command(alias = "z")]
    Gzip {
        /// File to compress.
        #[arg(required = true)]
        file: PathBuf,

        #[command(flatten)]
        gzip: GzipArgs,

        /// Delete FILE.gz once it has been measured.
        #[arg(long)]
        discard: bool,
    },
}

/// Compression settings shared by `build` and `gzip`.
#[derive(ClapArgs, Clone, Debug)]
pub struct GzipArgs {
    /// zlib compression level (0-9).
    #[arg(long, default_value_t = DEFAULT_LEVEL, value_parser = clap::value_parser!(u32).range(0..=9))]
    pub compress_level: u32,

    /// Single deflate stream or parallel independent blocks.
    #[arg(long, value_enum, default_value_t = CompressionMode::Parallel)]
    pub mode: CompressionMode,

    /// Number of compression threads. [0 = auto-detect based on CPU cores]
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Block size in KiB for parallel mode.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE_KB)]
    pub blocksize: usize,
}

impl GzipArgs {
    pub fn to_options(&self) -> GzipOptions {
        GzipOptions {
            level: self.compress_level,
            mode: self.mode,
            workers: self.workers,
            block_size_kb: self.blocksize,
        }
    }
}

/// Selects the gzip strategy for the data payload.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// One deflate stream over the whole input.
    SingleThreaded,
    /// Independent blocks compressed concurrently, stitched into one gzip member.
    #[default]
    Parallel,
}

/// Selects the ar container writer.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ArchiverKind {
    /// Write the container in-process.
    #[default]
    Native,
    /// Run an external `ar` program.
    Ar,
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Result<Args, clap::Error> {
    Args::try_parse()
}
