//! The backing store: where directory contents and file bytes actually come
//! from.
//!
//! [`BackingStore`] is the seam between the sorted view and real I/O. It does
//! no caching and no sorting; errors are surfaced exactly as the underlying
//! store reported them. [`LocalBacking`] implements it over a host directory.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::os::unix::fs::{FileExt as _, MetadataExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use nix::sys::statvfs::statvfs;
use tracing::debug;

use super::{BackingId, Entry, EntryKind, FsStats, InodePerms, VPath};

/// A reader for an open backing file, returned by [`BackingStore::open`].
///
/// Shared behind an `Arc` so concurrent reads on one handle do not serialize.
/// Dropping the last reference releases the underlying resource.
pub trait FileReader: Send + Sync + 'static {
    /// Read up to `size` bytes starting at byte `offset`.
    ///
    /// Returns fewer bytes only at end-of-file, and an empty buffer at or
    /// past it.
    fn read(
        &self,
        offset: u64,
        size: u32,
    ) -> impl Future<Output = Result<Bytes, std::io::Error>> + Send;
}

/// Mechanical path-level access to the tree being presented.
pub trait BackingStore: Clone + Send + Sync + 'static {
    /// The reader type returned by [`open`](Self::open).
    type Reader: FileReader;

    /// Metadata of the object at `path`, without following a final symlink.
    fn stat(&self, path: &VPath)
    -> impl Future<Output = Result<Entry, std::io::Error>> + Send;

    /// Every member of the directory at `path`, in whatever order the store
    /// produces them. Never includes `.` or `..`.
    fn list(
        &self,
        path: &VPath,
    ) -> impl Future<Output = Result<Vec<Entry>, std::io::Error>> + Send;

    /// Open the regular file at `path` for reading.
    ///
    /// `expected` is the entry the caller just stat'ed; implementations
    /// should refuse to open a different object that raced into its place.
    fn open(
        &self,
        path: &VPath,
        expected: &Entry,
    ) -> impl Future<Output = Result<Self::Reader, std::io::Error>> + Send;

    /// The target of the symlink at `path`.
    fn read_link(
        &self,
        path: &VPath,
    ) -> impl Future<Output = Result<OsString, std::io::Error>> + Send;

    /// Capacity statistics of the store.
    fn statfs(&self) -> impl Future<Output = Result<FsStats, std::io::Error>> + Send;
}

fn stale() -> std::io::Error {
    std::io::Error::from_raw_os_error(libc::ESTALE)
}

/// Build an [`Entry`] from host metadata.
#[must_use]
pub fn entry_from_metadata(name: OsString, meta: &std::fs::Metadata) -> Entry {
    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Other
    };

    Entry {
        name,
        kind,
        size: meta.len(),
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        permissions: InodePerms::from_mode(meta.mode()),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        id: BackingId {
            dev: meta.dev(),
            ino: meta.ino(),
        },
    }
}

/// A [`BackingStore`] over a directory on the host filesystem.
#[derive(Debug, Clone)]
pub struct LocalBacking {
    root: Arc<Path>,
}

impl LocalBacking {
    /// Serve the tree rooted at `root`. The path should be absolute.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        Self {
            root: Arc::from(root),
        }
    }

    /// The host directory being presented.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a virtual path.
    #[must_use]
    pub fn real_path(&self, path: &VPath) -> PathBuf {
        if path.is_root() {
            self.root.to_path_buf()
        } else {
            self.root.join(path.relative())
        }
    }
}

impl BackingStore for LocalBacking {
    type Reader = LocalReader;

    async fn stat(&self, path: &VPath) -> Result<Entry, std::io::Error> {
        let meta = tokio::fs::symlink_metadata(self.real_path(path)).await?;
        let name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
        Ok(entry_from_metadata(name, &meta))
    }

    async fn list(&self, path: &VPath) -> Result<Vec<Entry>, std::io::Error> {
        let mut read_dir = tokio::fs::read_dir(self.real_path(path)).await?;
        let mut entries = Vec::new();
        while let Some(dir_entry) = read_dir.next_entry().await? {
            // DirEntry::metadata does not traverse symlinks.
            match dir_entry.metadata().await {
                Ok(meta) => entries.push(entry_from_metadata(dir_entry.file_name(), &meta)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(name = ?dir_entry.file_name(), %path, "entry vanished while listing, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    async fn open(&self, path: &VPath, expected: &Entry) -> Result<LocalReader, std::io::Error> {
        let real = self.real_path(path);
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&real)
            .await?
            .into_std()
            .await;

        let meta = file.metadata()?;
        let id = BackingId {
            dev: meta.dev(),
            ino: meta.ino(),
        };
        if id != expected.id {
            debug!(%path, "backing file replaced between stat and open");
            return Err(stale());
        }

        Ok(LocalReader {
            path: real,
            file: Arc::new(file),
            id,
        })
    }

    async fn read_link(&self, path: &VPath) -> Result<OsString, std::io::Error> {
        let target = tokio::fs::read_link(self.real_path(path)).await?;
        Ok(target.into_os_string())
    }

    #[allow(clippy::allow_attributes, clippy::useless_conversion)]
    async fn statfs(&self) -> Result<FsStats, std::io::Error> {
        let stat = statvfs(&*self.root)?;
        let to_u32 = |v: u64, what: &str| {
            u32::try_from(v).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{what} too large to fit into u32"),
                )
            })
        };

        Ok(FsStats {
            block_size: to_u32(u64::from(stat.block_size()), "block size")?,
            fragment_size: to_u32(u64::from(stat.fragment_size()), "fragment size")?,
            total_blocks: u64::from(stat.blocks()),
            free_blocks: u64::from(stat.blocks_free()),
            available_blocks: u64::from(stat.blocks_available()),
            total_inodes: u64::from(stat.files()),
            free_inodes: u64::from(stat.files_free()),
            max_filename_length: to_u32(u64::from(stat.name_max()), "max filename length")?,
        })
    }
}

/// An open file under a [`LocalBacking`].
///
/// Holds the descriptor and the identity captured at open time. Before each
/// read the path is re-checked: if the file was deleted the read fails with
/// `ENOENT`, if it was replaced with `ESTALE`.
#[derive(Debug)]
pub struct LocalReader {
    path: PathBuf,
    file: Arc<std::fs::File>,
    id: BackingId,
}

impl FileReader for LocalReader {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, std::io::Error> {
        let meta = tokio::fs::symlink_metadata(&self.path).await?;
        if meta.dev() != self.id.dev || meta.ino() != self.id.ino {
            return Err(stale());
        }

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || read_full_at(&file, offset, size as usize))
            .await
            .map_err(std::io::Error::other)?
    }
}

/// `pread` until `size` bytes are read or end-of-file is reached.
fn read_full_at(file: &std::fs::File, offset: u64, size: usize) -> Result<Bytes, std::io::Error> {
    let mut buffer = vec![0u8; size];
    let mut filled = 0usize;
    while filled < size {
        let at = offset.saturating_add(filled as u64);
        match file.read_at(&mut buffer[filled..], at) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buffer.truncate(filled);
    Ok(Bytes::from(buffer))
}
