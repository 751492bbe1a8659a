//! Gzip member framing (RFC 1952) around raw deflate data.
//!
//! The parallel encoder produces raw deflate blocks itself, so it has to write
//! the 10-byte header and the 8-byte trailer on its own. The header mirrors the
//! one `flate2::GzBuilder` emits with default settings: no file name, mtime 0,
//! OS byte 255.

pub const HEADER_LEN: usize = 10;
pub const TRAILER_LEN: usize = 8;

const MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 8;
const OS_UNKNOWN: u8 = 255;

/// XFL hint byte: 2 for maximum compression, 4 for the fastest levels.
fn extra_flags(level: u32) -> u8 {
    if level >= 9 {
        2
    } else if level <= 1 {
        4
    } else {
        0
    }
}

pub fn write_header(out: &mut Vec<u8>, level: u32) {
    out.extend_from_slice(&MAGIC);
    out.push(METHOD_DEFLATE);
    out.push(0); // FLG
    out.extend_from_slice(&0u32.to_le_bytes()); // MTIME
    out.push(extra_flags(level));
    out.push(OS_UNKNOWN);
}

/// Appends CRC-32 and ISIZE (length modulo 2^32) of the whole uncompressed input.
pub fn write_trailer(out: &mut Vec<u8>, crc: u32, len: u64) {
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(len as u32).to_le_bytes());
}
