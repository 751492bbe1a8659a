#![allow(dead_code)]

use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use tempfile::TempDir;

/// One member of an ar container.
pub struct ArMember {
    pub name: String,
    pub data: Vec<u8>,
}

/// Minimal ar reader for assertions: magic, 60-byte headers, even padding.
pub fn read_ar(bytes: &[u8]) -> Vec<ArMember> {
    assert_eq!(&bytes[..8], b"!<arch>\n", "missing ar magic");
    let mut members = Vec::new();
    let mut pos = 8;
    while pos < bytes.len() {
        let header = &bytes[pos..pos + 60];
        assert_eq!(&header[58..60], b"`\n", "bad header terminator");
        let name = String::from_utf8_lossy(&header[..16]).trim_end().trim_end_matches('/').to_string();
        let size: usize = String::from_utf8_lossy(&header[48..58]).trim().parse().unwrap();
        let start = pos + 60;
        members.push(ArMember { name, data: bytes[start..start + size].to_vec() });
        pos = start + size + (size % 2);
    }
    members
}

pub fn gunzip(gz: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(gz).read_to_end(&mut out).unwrap();
    out
}

/// (path, mode, content) for every regular file in a tar stream.
pub fn tar_files(tar_bytes: &[u8]) -> Vec<(String, u32, Vec<u8>)> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let mode = entry.header().mode().unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        files.push((path, mode, data));
    }
    files
}

/// Every entry name in a tar stream, exactly as stored.
pub fn tar_names(tar_bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    archive
        .entries()
        .unwrap()
        .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).into_owned())
        .collect()
}

pub fn write_file(root: &Path, rel: &str, content: &[u8], mode: u32) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    fastdeb::fsx::set_unix_permissions(&path, mode).unwrap();
}

/// Staged tree with DEBIAN/control, DEBIAN/postinst and usr/local/bin/app.
pub fn sample_stage() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "DEBIAN/control", b"Package: mk-deb-fake\nVersion: 1.0\nArchitecture: all\n", 0o644);
    write_file(dir.path(), "DEBIAN/postinst", b"#!/bin/sh\nchown www-data /usr/local/bin/app\n", 0o755);
    write_file(dir.path(), "usr/local/bin/app", b"\x7fELF fake binary payload", 0o755);
    dir
}
