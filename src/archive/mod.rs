//! # ar Container Writers
//!
//! A Debian package is an `ar` archive: the global magic `!<arch>\n` followed by
//! members, each preceded by a fixed 60-byte ASCII header and padded to an even
//! length. The assembler only needs "write these files, in this order, as a new
//! container", expressed by [`ContainerWriter`]. Two implementations exist:
//!
//! - [`NativeArWriter`] writes the format directly.
//! - [`ArTool`] runs an external `ar` program with each argument passed
//!   separately, never through a shell.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

pub use crate::cli::ArchiverKind;
use crate::error::{DebError, Result};
use crate::fsx;

pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
pub const AR_HEADER_LEN: usize = 60;
const AR_NAME_MAX: usize = 16;
const AR_SIZE_MAX: u64 = 9_999_999_999;

/// A file to be stored in the container under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMember {
    pub name: String,
    pub path: PathBuf,
}

impl ContainerMember {
    /// A member named after the final component of `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DebError::InvalidOption(format!("'{}' has no usable file name", path.display())))?
            .to_string();
        Ok(Self { name, path })
    }
}

/// Writes an ordered list of member files into a fresh container at `output`.
pub trait ContainerWriter: Send + Sync {
    /// Short label used in logs and error messages.
    fn name(&self) -> &str;

    fn write_container(&self, output: &Path, members: &[ContainerMember]) -> Result<()>;
}

fn container_error(tool: &str, diagnostic: impl Into<String>) -> DebError {
    DebError::ContainerWrite { tool: tool.to_string(), diagnostic: diagnostic.into() }
}

/// Checks that every member name is storable in a 16-byte ar name field and
/// matches the file it comes from.
fn check_members(tool: &str, members: &[ContainerMember]) -> Result<()> {
    if members.is_empty() {
        return Err(container_error(tool, "no members to write"));
    }
    for member in members {
        let name = member.name.as_str();
        let valid = !name.is_empty()
            && name.len() < AR_NAME_MAX
            && name.bytes().all(|b| b.is_ascii_graphic() && b != b'/');
        if !valid {
            return Err(container_error(tool, format!("member name '{name}' cannot be stored in an ar header")));
        }
        if member.path.file_name().and_then(|n| n.to_str()) != Some(name) {
            return Err(container_error(
                tool,
                format!("member '{name}' does not match file '{}'", member.path.display()),
            ));
        }
    }
    Ok(())
}

/// Encodes one ar member header. Owner and group are always 0.
pub fn encode_header(name: &str, mtime: u64, mode: u32, size: u64) -> Result<[u8; AR_HEADER_LEN]> {
    if size > AR_SIZE_MAX {
        return Err(container_error("ar", format!("member '{name}' is too large ({size} bytes)")));
    }
    let text = format!("{:<16}{:<12}{:<6}{:<6}{:<8o}{:<10}`\n", name, mtime, 0, 0, mode, size);
    let bytes = text.as_bytes();
    if bytes.len() != AR_HEADER_LEN {
        return Err(container_error("ar", format!("header for '{name}' does not fit")));
    }
    let mut header = [0u8; AR_HEADER_LEN];
    header.copy_from_slice(bytes);
    Ok(header)
}

/// In-process ar writer in the layout `dpkg-deb` produces.
#[derive(Debug, Clone, Default)]
pub struct NativeArWriter {
    /// Member timestamp; `None` uses the current time.
    pub mtime: Option<u64>,
}

impl NativeArWriter {
    fn timestamp(&self) -> u64 {
        self.mtime.unwrap_or_else(|| {
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
        })
    }
}

impl ContainerWriter for NativeArWriter {
    fn name(&self) -> &str {
        "native ar writer"
    }

    fn write_container(&self, output: &Path, members: &[ContainerMember]) -> Result<()> {
        check_members(self.name(), members)?;
        let mtime = self.timestamp();
        let file = File::create(output).map_err(|e| DebError::io(e, output))?;
        let mut out = BufWriter::new(file);
        out.write_all(AR_MAGIC).map_err(|e| DebError::io(e, output))?;

        for member in members {
            let mut src = File::open(&member.path).map_err(|e| DebError::io(e, &member.path))?;
            let size = src.metadata().map_err(|e| DebError::io(e, &member.path))?.len();
            let header = encode_header(&member.name, mtime, 0o100644, size)?;
            out.write_all(&header).map_err(|e| DebError::io(e, output))?;
            let copied = io::copy(&mut src, &mut out).map_err(|e| DebError::io(e, &member.path))?;
            if copied != size {
                return Err(container_error(
                    self.name(),
                    format!("'{}' changed size while being stored", member.path.display()),
                ));
            }
            if size % 2 == 1 {
                out.write_all(b"\n").map_err(|e| DebError::io(e, output))?;
            }
            debug!(member = %member.name, size, "Stored member");
        }

        let file = out.into_inner().map_err(|e| DebError::io(e.into_error(), output))?;
        file.sync_all().map_err(|e| DebError::io(e, output))?;
        Ok(())
    }
}

/// Delegates to an external `ar` binary: `<program> rc <output> <members...>`,
/// run from the directory holding the members so they are stored by name.
#[derive(Debug, Clone)]
pub struct ArTool {
    pub program: PathBuf,
    label: String,
}

impl ArTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let label = program.display().to_string();
        Self { program, label }
    }
}

impl Default for ArTool {
    fn default() -> Self {
        Self::new("ar")
    }
}

impl ContainerWriter for ArTool {
    fn name(&self) -> &str {
        &self.label
    }

    fn write_container(&self, output: &Path, members: &[ContainerMember]) -> Result<()> {
        check_members(self.name(), members)?;
        let dir = members[0].path.parent().unwrap_or_else(|| Path::new("."));
        if members.iter().any(|m| m.path.parent().unwrap_or_else(|| Path::new(".")) != dir) {
            return Err(container_error(self.name(), "members must share one directory"));
        }

        // The tool runs from `dir`, so a relative output would land there.
        let output = fsx::absolutize(output).map_err(|e| DebError::io(e, output))?;
        let output = output.as_path();

        let mut cmd = Command::new(&self.program);
        cmd.arg("rc").arg(output).args(members.iter().map(|m| &m.name)).current_dir(dir);
        debug!(command = ?cmd, "Running archiver");

        let result = cmd.output().map_err(|e| DebError::ArchiverUnavailable {
            tool: self.label.clone(),
            source: e,
        })?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            let diagnostic = if stderr.is_empty() { result.status.to_string() } else { stderr };
            return Err(container_error(self.name(), diagnostic));
        }
        if !output.is_file() {
            return Err(container_error(self.name(), format!("no container at '{}'", output.display())));
        }
        Ok(())
    }
}
