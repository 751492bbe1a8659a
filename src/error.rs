use std::path::PathBuf;

use crate::progress::BuildStage;

/// Broad category of a [`DebError`], used by callers that only need to know
/// which part of the pipeline rejected the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The staged tree is unusable (missing `DEBIAN`, unreadable entries).
    Input,
    /// An option is out of range.
    Config,
    /// The gzip encoder or one of its workers failed.
    Compression,
    /// The ar container could not be written.
    ContainerWrite,
    /// Any other filesystem failure.
    Io,
}

/// The primary error type for all operations in the `fastdeb` crate.
#[derive(Debug, thiserror::Error)]
pub enum DebError {
    /// The staged tree has no `DEBIAN` directory at its root.
    #[error("staged tree '{}' has no DEBIAN directory", .root.display())]
    MissingControlDir { root: PathBuf },

    /// A configuration value is out of range.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}'", .path.display())]
    Io { source: std::io::Error, path: PathBuf },

    /// A file in the staged tree could not be read.
    #[error("cannot read '{}'", .path.display())]
    Unreadable { source: std::io::Error, path: PathBuf },

    /// The staged tree could not be traversed.
    #[error("cannot walk '{}'", .path.display())]
    Walk { source: walkdir::Error, path: PathBuf },

    /// Compression failed; no partial output is kept.
    #[error("compression failed: {0}")]
    Compression(String),

    /// The container writer ran but reported a failure.
    #[error("{tool} failed: {diagnostic}")]
    ContainerWrite { tool: String, diagnostic: String },

    /// The external archiver could not be started.
    #[error("cannot run archiver '{tool}'")]
    ArchiverUnavailable { tool: String, source: std::io::Error },

    /// Wraps an error with the build stage it happened in.
    #[error("{stage} stage failed")]
    Stage {
        stage: BuildStage,
        #[source]
        source: Box<DebError>,
    },
}

impl DebError {
    pub(crate) fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DebError::Io { source, path: path.into() }
    }

    /// Attaches `stage` unless the error already names one.
    pub fn in_stage(self, stage: BuildStage) -> Self {
        match self {
            DebError::Stage { .. } => self,
            other => DebError::Stage { stage, source: Box::new(other) },
        }
    }

    /// The stage recorded on this error, if any.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            DebError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DebError::MissingControlDir { .. }
            | DebError::Unreadable { .. }
            | DebError::Walk { .. } => ErrorClass::Input,
            DebError::InvalidOption(_) => ErrorClass::Config,
            DebError::Io { .. } => ErrorClass::Io,
            DebError::Compression(_) => ErrorClass::Compression,
            DebError::ContainerWrite { .. } | DebError::ArchiverUnavailable { .. } => {
                ErrorClass::ContainerWrite
            }
            DebError::Stage { source, .. } => source.class(),
        }
    }
}

impl From<std::io::Error> for DebError {
    fn from(err: std::io::Error) -> Self {
        DebError::Io { source: err, path: PathBuf::new() } // Generic path
    }
}

pub type Result<T, E = DebError> = std::result::Result<T, E>;

/// The message of `err` followed by each of its sources, joined by `": "`.
pub fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
