//! Tar stream production for the control and data tarballs.
//!
//! [`TreeArchiver`] is the seam the assembler depends on; [`TarArchiver`] is the
//! implementation on top of the `tar` crate. The layout follows `dpkg-deb`: a
//! `./` entry for the archived root, then every entry in sorted order named
//! `./<relative path>`, with a trailing `/` on directories. Two builds of the
//! same tree produce the same member list.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path};

use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{DebError, Result};

/// Width of the name and link name fields of a ustar/GNU header.
const NAME_FIELD_LEN: usize = 100;
const GNU_LONG_LINK: &[u8] = b"././@LongLink";

/// What was written to a tar stream. The `./` root entry is not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TarSummary {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    /// Sum of regular file sizes.
    pub payload_bytes: u64,
}

/// Produces an uncompressed tar stream of a directory tree.
pub trait TreeArchiver: Send + Sync {
    /// Archives every entry under `root` except the top-level names in
    /// `exclude`, writing the stream to `out`.
    fn archive(&self, root: &Path, exclude: &[&OsStr], out: &mut dyn Write) -> Result<TarSummary>;
}

/// Tar writer backed by the `tar` crate (GNU headers).
#[derive(Debug, Clone)]
pub struct TarArchiver {
    /// Record every entry as owned by root:root, as package builds expect.
    pub root_owner: bool,
    /// Override all modification times (e.g. from `SOURCE_DATE_EPOCH`).
    pub mtime: Option<u64>,
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self { root_owner: true, mtime: None }
    }
}

fn is_excluded(rel: &Path, exclude: &[&OsStr]) -> bool {
    match rel.components().next() {
        Some(Component::Normal(first)) => exclude.iter().any(|name| *name == first),
        _ => false,
    }
}

#[cfg(unix)]
fn os_bytes(part: &OsStr) -> io::Result<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    Ok(part.as_bytes())
}

#[cfg(not(unix))]
fn os_bytes(part: &OsStr) -> io::Result<&[u8]> {
    part.to_str()
        .map(str::as_bytes)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "path is not valid unicode"))
}

/// `./` followed by the components of `rel` joined with `/`; directories get a trailing `/`.
fn entry_name(rel: &Path, is_dir: bool) -> io::Result<Vec<u8>> {
    let mut name = b".".to_vec();
    for component in rel.components() {
        let Component::Normal(part) = component else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "unexpected path component"));
        };
        name.push(b'/');
        name.extend_from_slice(os_bytes(part)?);
    }
    if is_dir {
        name.push(b'/');
    }
    Ok(name)
}

fn fill_field(field: &mut [u8; NAME_FIELD_LEN], value: &[u8]) {
    let len = value.len().min(NAME_FIELD_LEN);
    field.fill(0);
    field[..len].copy_from_slice(&value[..len]);
}

/// Writes a GNU `L`/`K` record carrying a name that does not fit a header field.
fn append_long_record<W: Write>(builder: &mut Builder<W>, kind: EntryType, value: &[u8]) -> io::Result<()> {
    let mut header = Header::new_gnu();
    fill_field(&mut header.as_old_mut().name, GNU_LONG_LINK);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_entry_type(kind);
    header.set_size(value.len() as u64 + 1);
    header.set_cksum();
    builder.append(&header, value.chain(&[0u8][..]))
}

/// Appends one entry whose name (and link target) are stored byte for byte,
/// spilling into GNU long-name records when they exceed 100 bytes.
fn append_named<W: Write, R: Read>(
    builder: &mut Builder<W>,
    header: &mut Header,
    name: &[u8],
    link: Option<&[u8]>,
    data: R,
) -> io::Result<()> {
    if name.len() > NAME_FIELD_LEN {
        append_long_record(builder, EntryType::GNULongName, name)?;
    }
    fill_field(&mut header.as_old_mut().name, name);
    if let Some(link) = link {
        if link.len() > NAME_FIELD_LEN {
            append_long_record(builder, EntryType::GNULongLink, link)?;
        }
        fill_field(&mut header.as_old_mut().linkname, link);
    }
    header.set_cksum();
    builder.append(header, data)
}

impl TarArchiver {
    fn header_for(&self, meta: &fs::Metadata) -> Result<Header> {
        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(meta, HeaderMode::Complete);
        // Access and change times would make every rebuild differ.
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(0);
            gnu.set_ctime(0);
        }
        if self.root_owner {
            header.set_uid(0);
            header.set_gid(0);
            header.set_username("root")?;
            header.set_groupname("root")?;
        }
        if let Some(mtime) = self.mtime {
            header.set_mtime(mtime);
        }
        Ok(header)
    }
}

impl TreeArchiver for TarArchiver {
    fn archive(&self, root: &Path, exclude: &[&OsStr], out: &mut dyn Write) -> Result<TarSummary> {
        let mut builder = Builder::new(out);
        let mut summary = TarSummary::default();

        let root_meta = fs::metadata(root).map_err(|e| DebError::Unreadable { source: e, path: root.to_path_buf() })?;
        let mut root_header = self.header_for(&root_meta)?;
        root_header.set_entry_type(EntryType::Directory);
        root_header.set_size(0);
        append_named(&mut builder, &mut root_header, b"./", None, io::empty()).map_err(|e| DebError::io(e, root))?;

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.path()
                    .strip_prefix(root)
                    .map(|rel| !is_excluded(rel, exclude))
                    .unwrap_or(true)
            });

        for entry in walker {
            let entry = entry.map_err(|e| DebError::Walk { source: e, path: root.to_path_buf() })?;
            let path = entry.path();
            let rel = path.strip_prefix(root).map_err(|_| DebError::Unreadable {
                source: io::Error::new(io::ErrorKind::InvalidInput, "entry outside archive root"),
                path: path.to_path_buf(),
            })?;
            let meta = fs::symlink_metadata(path).map_err(|e| DebError::Unreadable { source: e, path: path.to_path_buf() })?;
            let mut header = self.header_for(&meta)?;
            let file_type = meta.file_type();
            let name = entry_name(rel, file_type.is_dir()).map_err(|e| DebError::Unreadable { source: e, path: path.to_path_buf() })?;

            if file_type.is_dir() {
                header.set_size(0);
                append_named(&mut builder, &mut header, &name, None, io::empty()).map_err(|e| DebError::io(e, path))?;
                summary.dirs += 1;
            } else if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(|e| DebError::Unreadable { source: e, path: path.to_path_buf() })?;
                let target = os_bytes(target.as_os_str()).map_err(|e| DebError::Unreadable { source: e, path: path.to_path_buf() })?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                append_named(&mut builder, &mut header, &name, Some(target), io::empty())
                    .map_err(|e| DebError::io(e, path))?;
                summary.symlinks += 1;
            } else if file_type.is_file() {
                let file = File::open(path).map_err(|e| DebError::Unreadable { source: e, path: path.to_path_buf() })?;
                append_named(&mut builder, &mut header, &name, None, file).map_err(|e| DebError::io(e, path))?;
                summary.files += 1;
                summary.payload_bytes += meta.len();
            } else {
                warn!(path = %path.display(), "Skipping special file");
                continue;
            }
            debug!(entry = %String::from_utf8_lossy(&name), "Archived");
        }

        builder.finish().map_err(|e| DebError::io(e, root))?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tar::Archive;

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = Archive::new(Cursor::new(tar_bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).into_owned())
            .collect()
    }

    #[test]
    fn excludes_top_level_names_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("DEBIAN")).unwrap();
        fs::write(dir.path().join("DEBIAN/control"), "Package: x\n").unwrap();
        fs::create_dir_all(dir.path().join("usr/share/DEBIAN")).unwrap();
        fs::write(dir.path().join("usr/share/DEBIAN/keep"), "k").unwrap();

        let mut out = Vec::new();
        let summary = TarArchiver::default()
            .archive(dir.path(), &[OsStr::new("DEBIAN")], &mut out)
            .unwrap();

        let names = entry_names(&out);
        assert_eq!(names, vec!["./", "./usr/", "./usr/share/", "./usr/share/DEBIAN/", "./usr/share/DEBIAN/keep"]);
        assert_eq!(summary.files, 1);
        assert_eq!(summary.dirs, 3);
    }

    #[test]
    fn root_entry_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("control"), "Package: x\n").unwrap();

        let mut out = Vec::new();
        TarArchiver::default().archive(dir.path(), &[], &mut out).unwrap();

        let mut archive = Archive::new(Cursor::new(out));
        let entries: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (String::from_utf8_lossy(&e.path_bytes()).into_owned(), e.header().entry_type())
            })
            .collect();
        assert_eq!(
            entries,
            vec![("./".to_string(), EntryType::Directory), ("./control".to_string(), EntryType::Regular)]
        );
    }

    #[test]
    fn headers_are_root_owned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "alpha").unwrap();

        let mut out = Vec::new();
        TarArchiver { root_owner: true, mtime: Some(42) }
            .archive(dir.path(), &[], &mut out)
            .unwrap();

        let mut archive = Archive::new(Cursor::new(out));
        let entry = archive.entries().unwrap().nth(1).unwrap().unwrap();
        let header = entry.header();
        assert_eq!(entry.path().unwrap().to_str(), Some("./a"));
        assert_eq!(header.uid().unwrap(), 0);
        assert_eq!(header.gid().unwrap(), 0);
        assert_eq!(header.username().unwrap(), Some("root"));
        assert_eq!(header.mtime().unwrap(), 42);
        assert_eq!(header.size().unwrap(), 5);
    }

    #[test]
    fn long_names_keep_dot_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let deep = "d".repeat(60);
        let file = "f".repeat(70);
        fs::create_dir_all(dir.path().join(&deep)).unwrap();
        fs::write(dir.path().join(&deep).join(&file), "payload").unwrap();

        let mut out = Vec::new();
        TarArchiver::default().archive(dir.path(), &[], &mut out).unwrap();

        let mut archive = Archive::new(Cursor::new(out));
        let mut entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.header().entry_type() == EntryType::Regular)
            .unwrap();
        let expected = format!("./{deep}/{file}");
        assert!(expected.len() > NAME_FIELD_LEN);
        assert_eq!(String::from_utf8_lossy(&entry.path_bytes()), expected);
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "payload");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_stored_as_links() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("target"), "t").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();
        let far = format!("../{}/target", "x".repeat(120));
        std::os::unix::fs::symlink(&far, dir.path().join("far")).unwrap();

        let mut out = Vec::new();
        let summary = TarArchiver::default().archive(dir.path(), &[], &mut out).unwrap();
        assert_eq!(summary.symlinks, 2);

        let mut archive = Archive::new(Cursor::new(out));
        let links: Vec<(String, String)> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.header().entry_type() == EntryType::Symlink)
            .map(|e| {
                (
                    String::from_utf8_lossy(&e.path_bytes()).into_owned(),
                    String::from_utf8_lossy(&e.link_name_bytes().unwrap()).into_owned(),
                )
            })
            .collect();
        assert_eq!(links, vec![("./far".to_string(), far), ("./link".to_string(), "target".to_string())]);
    }

    #[test]
    fn empty_tree_holds_only_the_root_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let summary = TarArchiver::default().archive(dir.path(), &[], &mut out).unwrap();
        assert_eq!(summary, TarSummary::default());
        assert_eq!(entry_names(&out), vec!["./"]);
        assert_eq!(out.len(), 512 + 1024);
    }
}
