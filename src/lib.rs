//! # fastdeb Core Library
//!
//! This crate builds Debian binary packages (`.deb`) from a staged directory
//! tree. The slow part of that job, gzip-compressing the data payload, can run
//! on all cores while still producing a single gzip stream that any standard
//! decoder reads.
//!
//! It is designed to be used by the `fastdeb` command-line application, but its
//! public API can also be used to build packages programmatically.
//!
//! ## Key Modules
//!
//! - [`package`]: The build pipeline from staged tree to `.deb`.
//! - [`compress`]: Single-threaded and parallel gzip strategies.
//! - [`workers`]: The block compression worker pool.
//! - [`tarball`]: Tar stream production for the control and data tarballs.
//! - [`archive`]: `ar` container writers (in-process or an external `ar`).
//!
//! ## Examples
//!
//! ```no_run
//! use fastdeb::package::{build, BuildOptions};
//! use std::path::Path;
//!
//! let report = build(Path::new("stage"), Path::new("demo.deb"), &BuildOptions::default())?;
//! println!("{} bytes", report.package_bytes);
//! # Ok::<(), fastdeb::DebError>(())
//! ```

pub mod archive;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod compress;
pub mod error;
pub use error::{DebError, ErrorClass};

pub mod workers;

pub mod package;
pub mod progress;
pub mod tarball;

// Cross-platform filesystem helpers
pub mod fsx;
