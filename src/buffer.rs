//! In-memory file buffer that can be flushed to disk.
//!
//! A [`FileBuffer`] accumulates the bodies of many packets destined for one
//! path. The processor appends to it while a writer task may concurrently
//! flush it, so mutation is serialized by an internal mutex; `len()` reads an
//! atomic and may lag the latest append by one write.

use std::fs::{DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Mode for destination files.
const FILE_MODE: u32 = 0o664;
/// Mode for created parent directories.
const DIR_MODE: u32 = 0o755;

/// Why a buffer is being flushed. Expired flushes feed the expires counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushKind {
    Command,
    Expired,
}

/// Options passed into [`FileBuffer::flush`].
#[derive(Clone, Copy, Debug)]
pub struct FlushOpts {
    /// Replace the destination file instead of appending to it.
    pub truncate: bool,
    pub kind: FlushKind,
}

/// Holds a file's bytes before they get flushed to disk.
pub struct FileBuffer {
    path: PathBuf,
    first_write: Instant,
    len: AtomicUsize,
    inner: Mutex<Inner>,
}

struct Inner {
    bytes: Vec<u8>,
    writes: u64,
}

impl FileBuffer {
    /// Create a buffer for `path` seeded with `data`. The creation time is
    /// fixed here and drives age-based expiry; it is never updated.
    pub fn new(path: PathBuf, data: &[u8]) -> Self {
        Self {
            path,
            first_write: Instant::now(),
            len: AtomicUsize::new(data.len()),
            inner: Mutex::new(Inner {
                bytes: data.to_vec(),
                writes: 1,
            }),
        }
    }

    /// Append `data` and increment the write counter. Appends are serialized;
    /// the bytes of a single append are never interleaved with another.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.bytes.extend_from_slice(data);
        inner.writes += 1;
        self.len.store(inner.bytes.len(), Ordering::Release);
    }

    /// Current buffered length. Advisory: taken without the lock, so it may
    /// trail a concurrent append.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Number of appends since creation, including the seeding write.
    pub fn writes(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .writes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_write(&self) -> Instant {
        self.first_write
    }

    /// Write the buffered bytes to the destination path, creating parent
    /// directories as needed. Opens with append semantics unless
    /// `opts.truncate`. Returns the number of bytes written.
    ///
    /// A failure leaves the buffered bytes untouched; the caller decides
    /// whether to log and drop or retry.
    pub fn flush(&self, opts: FlushOpts) -> io::Result<usize> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true).mode(FILE_MODE);
        if opts.truncate {
            options.truncate(true);
        } else {
            options.append(true);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(&inner.bytes)?;

        Ok(inner.bytes.len())
    }

    /// Recursively delete the destination path. Removing a path that does not
    /// exist is not an error.
    pub fn remove_tree(&self) -> io::Result<()> {
        let _inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        match std::fs::symlink_metadata(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&self.path),
            Ok(_) => std::fs::remove_file(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn opts(truncate: bool) -> FlushOpts {
        FlushOpts {
            truncate,
            kind: FlushKind::Command,
        }
    }

    #[test]
    fn append_tracks_len_and_writes() {
        let buf = FileBuffer::new(PathBuf::from("/tmp/unused"), b"hello\n");
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.writes(), 1);

        buf.append(b"world\n");
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.writes(), 2);
    }

    #[test]
    fn flush_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"old|").unwrap();

        let buf = FileBuffer::new(path.clone(), b"new");
        let written = buf.flush(opts(false)).unwrap();
        assert_eq!(written, 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"old|new");
    }

    #[test]
    fn flush_truncate_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.log");
        std::fs::write(&path, b"OLD").unwrap();

        let buf = FileBuffer::new(path.clone(), b"NEW\n");
        buf.flush(opts(true)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"NEW\n");
    }

    #[test]
    fn flush_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/c.log");

        let buf = FileBuffer::new(path.clone(), b"data");
        buf.flush(opts(false)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        let mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn flush_failure_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the destination path makes the open fail.
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();

        let buf = FileBuffer::new(path, b"kept");
        assert!(buf.flush(opts(false)).is_err());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn remove_tree_handles_files_dirs_and_missing() {
        let dir = tempfile::tempdir().unwrap();

        let file_path = dir.path().join("single.log");
        std::fs::write(&file_path, b"x").unwrap();
        FileBuffer::new(file_path.clone(), b"").remove_tree().unwrap();
        assert!(!file_path.exists());

        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/f.log"), b"x").unwrap();
        FileBuffer::new(tree.clone(), b"").remove_tree().unwrap();
        assert!(!tree.exists());

        // Missing path is fine.
        FileBuffer::new(dir.path().join("nope"), b"").remove_tree().unwrap();
    }
}
