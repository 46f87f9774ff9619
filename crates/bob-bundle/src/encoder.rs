//! Deterministic tar.gz encoding of a workspace directory.
//!
//! Two encodes of trees with the same relative paths and the same file
//! contents produce byte-identical archives, independent of ownership,
//! timestamps and enumeration order:
//!
//! - entries are written in lexicographic order of their relative path
//! - uid/gid are 0, owner and group names are `root`
//! - every mtime, including the gzip header's, is the epoch
//! - permissions collapse to `0o755` (owner execute bit) or `0o644`
//!
//! The returned digest is the SHA-256 of the finished compressed file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use tar::{Builder, Header, HeaderMode};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::digest;
use crate::error::{BundleError, BundleResult};

/// Owner and group name stored for every entry.
pub const ARCHIVE_OWNER: &str = "root";

/// Timestamp stored for every entry and for the gzip header.
pub const ARCHIVE_EPOCH: u64 = 0;

pub(crate) fn create_deterministic_tar<W: Write>(writer: W) -> Builder<GzEncoder<W>> {
    let encoder = GzBuilder::new()
        .mtime(ARCHIVE_EPOCH as u32)
        .operating_system(255)
        .write(writer, Compression::best());

    let mut tar = Builder::new(encoder);
    tar.mode(HeaderMode::Deterministic);
    tar
}

/// Force ownership and time fields to their canonical values.
pub(crate) fn canonicalize_header(header: &mut Header) -> io::Result<()> {
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(ARCHIVE_EPOCH);
    header.set_username(ARCHIVE_OWNER)?;
    header.set_groupname(ARCHIVE_OWNER)?;
    Ok(())
}

/// Archive every file below `workspace` into `dest` and return the digest.
///
/// Cancellation is checked before each entry and between read chunks. A
/// partially written `dest` is left behind on failure.
pub fn encode_workspace(
    workspace: &Path,
    dest: &Path,
    cancel: &CancelToken,
) -> BundleResult<String> {
    cancel.check()?;

    let result = write_archive(workspace, dest, cancel).and_then(|()| digest::sha256_file(dest));
    match result {
        Ok(digest) => Ok(digest),
        Err(_) if cancel.is_cancelled() => Err(BundleError::interrupted(format!(
            "encode of {} cancelled",
            workspace.display()
        ))),
        Err(source) => Err(BundleError::Encode {
            workspace: workspace.to_path_buf(),
            source,
        }),
    }
}

fn write_archive(workspace: &Path, dest: &Path, cancel: &CancelToken) -> io::Result<()> {
    let files = collect_files(workspace, cancel)?;
    tracing::debug!(
        workspace = %workspace.display(),
        files = files.len(),
        "encoding workspace"
    );

    let out = BufWriter::new(File::create(dest)?);
    let mut tar = create_deterministic_tar(out);

    for rel in &files {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        append_entry(&mut tar, workspace, rel, cancel)?;
    }

    let encoder = tar.into_inner()?;
    let mut out = encoder.finish()?;
    out.flush()?;
    Ok(())
}

/// Relative paths of all regular files and symlinks, sorted bytewise.
fn collect_files(workspace: &Path, cancel: &CancelToken) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(workspace).follow_links(false) {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let entry = entry?;
        let file_type = entry.file_type();
        if !(file_type.is_file() || file_type.is_symlink()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .map_err(io::Error::other)?;
        files.push(rel.to_path_buf());
    }
    files.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    Ok(files)
}

fn append_entry<W: Write>(
    tar: &mut Builder<W>,
    workspace: &Path,
    rel: &Path,
    cancel: &CancelToken,
) -> io::Result<()> {
    let path = workspace.join(rel);
    let meta = fs::symlink_metadata(&path)?;

    // Deterministic mode settles entry type, size and the 0o755/0o644 mode.
    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&meta, HeaderMode::Deterministic);
    canonicalize_header(&mut header)?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(&path)?;
        header.set_size(0);
        tar.append_link(&mut header, rel, target)
    } else {
        let file = File::open(&path)?;
        tar.append_data(&mut header, rel, CancellableReader::new(file, cancel))
    }
}

// Not `ErrorKind::Interrupted`: `io::copy` retries those forever.
fn cancelled() -> io::Error {
    io::Error::other("encode cancelled")
}

/// Fails reads once the token is cancelled.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    fn new(inner: R, cancel: &'a CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.inner.read(buf)
    }
}
