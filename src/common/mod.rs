//! Names and defaults shared across the build pipeline.

/// Control subdirectory of a staged tree.
pub const CONTROL_DIR: &str = "DEBIAN";

/// Container member holding the package format version.
pub const FORMAT_MARKER_NAME: &str = "debian-binary";
/// Exact content of [`FORMAT_MARKER_NAME`].
pub const FORMAT_MARKER: &[u8] = b"2.0\n";

pub const CONTROL_TAR: &str = "control.tar";
pub const CONTROL_MEMBER: &str = "control.tar.gz";
pub const DATA_TAR: &str = "data.tar";
pub const DATA_MEMBER: &str = "data.tar.gz";

/// Container members in the only order package managers accept.
pub const MEMBER_ORDER: [&str; 3] = [FORMAT_MARKER_NAME, CONTROL_MEMBER, DATA_MEMBER];

pub const DEFAULT_LEVEL: u32 = 6;
pub const DEFAULT_BLOCK_SIZE_KB: usize = 128;

/// Worker count used when the caller passes 0.
pub fn default_workers() -> usize {
    num_cpus::get().max(1)
}
