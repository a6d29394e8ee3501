//! Tar+gzip packing, unpacking and single-entry extraction.
//!
//! Volumes stream their content as gzip-compressed tar archives. Packing is
//! deterministic (sorted walk, zeroed mtime/uid/gid) so the same tree always
//! yields the same bytes.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, EntryType, Header};
use tracing::debug;

use crate::error::ArtifactError;
use crate::worker::ByteStream;

/// Strip leading `./` and `/` segments and any trailing `/`.
pub fn normalize_entry_path(path: &str) -> &str {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    let p = p.trim_end_matches('/');
    if p == "." {
        ""
    } else {
        p
    }
}

/// Deterministic tar+gzip archive of `path`.
///
/// A directory is archived with its contents relative to itself; a single
/// file is archived under its file name.
pub fn pack(path: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        let mut files = Vec::new();
        walk_sorted(path, &mut files)?;
        for file in files {
            let rel = file
                .strip_prefix(path)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            append(&mut builder, &file, rel)?;
        }
    } else {
        let name = path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("file"));
        append(&mut builder, path, &name)?;
    }

    builder.finish()?;
    let tar_bytes = builder.into_inner()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    encoder.finish()
}

fn walk_sorted(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();
    for entry in entries {
        out.push(entry.clone());
        if fs::symlink_metadata(&entry)?.is_dir() {
            walk_sorted(&entry, out)?;
        }
    }
    Ok(())
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &Path, rel: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder.append_data(&mut header, rel, io::empty())
    } else if file_type.is_file() {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
        header.set_size(metadata.len());
        builder.append_data(&mut header, rel, File::open(path)?)
    } else if file_type.is_symlink() {
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, rel, fs::read_link(path)?)
    } else {
        debug!(path = %path.display(), "skipping special file");
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Tar+gzip archive of in-memory `(name, contents)` files.
pub fn pack_files(files: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        builder.append_data(&mut header, name, *contents)?;
    }
    builder.finish()?;
    let tar_bytes = builder.into_inner()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    encoder.finish()
}

/// Unpack a tar+gzip stream into `dest`, creating it if needed.
pub fn unpack(stream: ByteStream, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(stream));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}

/// The payload of one archive entry.
///
/// Reads are bounded to the entry's size. Dropping the stream drops (and so
/// closes) the archive stream it was read from.
pub struct FileStream {
    inner: io::Take<GzDecoder<ByteStream>>,
    size: u64,
}

impl FileStream {
    /// Size of the entry in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Close the underlying archive stream.
    pub fn close(self) {}

    /// Read the remaining payload into memory.
    ///
    /// Fails with `UnexpectedEof` when the archive ends before the size its
    /// header declares.
    pub fn read_all(mut self) -> io::Result<Vec<u8>> {
        let remaining = self.inner.limit();
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        if (buf.len() as u64) < remaining {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated archive entry",
            ));
        }
        Ok(buf)
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream").field("size", &self.size).finish()
    }
}

/// Scan a tar+gzip stream for the entry named `path`.
///
/// Names are compared after [`normalize_entry_path`]. The returned stream
/// continues from the matched entry's payload.
pub fn open_entry(stream: ByteStream, path: &str) -> Result<FileStream, ArtifactError> {
    let wanted = normalize_entry_path(path);
    let mut archive = Archive::new(GzDecoder::new(stream));

    let mut found = None;
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        if normalize_entry_path(&entry.path()?.to_string_lossy()) == wanted {
            found = Some(entry.size());
            break;
        }
    }

    match found {
        Some(size) => Ok(FileStream {
            inner: archive.into_inner().take(size),
            size,
        }),
        None => Err(ArtifactError::FileNotFound {
            path: path.to_string(),
        }),
    }
}
