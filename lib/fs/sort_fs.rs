//! The operation dispatcher.
//!
//! [`SortFs`] answers every filesystem operation the kernel-facing layer
//! forwards. It is a set of `&self` async methods over shared state, safe to
//! call from any number of tasks at once; none of them holds a lock across
//! backing-store I/O.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, instrument, trace, warn};

use super::backing::{BackingStore, FileReader as _};
use super::handles::HandleTable;
use super::snapshot::SnapshotCache;
use super::sort::{self, SortOrder, SortedListing};
use super::{Entry, EntryKind, FsError, FsStats, Handle, OpenFlags, VPath};

/// Upper bound on operations in flight at once. Shutdown acquires all of them.
const MAX_IN_FLIGHT: u32 = 1 << 20;

/// Mount-wide settings, fixed for the lifetime of a [`SortFs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortConfig {
    /// How directory entries are ordered.
    pub order: SortOrder,
    /// How long a directory snapshot is served before the backing store is
    /// listed again.
    pub freshness: Duration,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            order: SortOrder::default(),
            freshness: Duration::from_secs(1),
        }
    }
}

/// What an open handle refers to.
#[derive(Debug)]
pub enum OpenResource<R> {
    /// An open regular file.
    File {
        /// Where the file was opened.
        path: VPath,
        /// Reader over the backing file.
        reader: R,
    },
    /// An open directory, pinned to the listing current at open time.
    Directory {
        /// The directory.
        path: VPath,
        /// The listing every `readdir` on this handle pages through.
        listing: Arc<SortedListing>,
    },
}

impl<R> OpenResource<R> {
    /// The path the resource was opened at.
    #[must_use]
    pub fn path(&self) -> &VPath {
        match self {
            Self::File { path, .. } | Self::Directory { path, .. } => path,
        }
    }
}

/// A sorted, read-only view of a [`BackingStore`].
pub struct SortFs<B: BackingStore> {
    config: Arc<SortConfig>,
    backing: B,
    snapshots: SnapshotCache,
    handles: HandleTable<OpenResource<B::Reader>>,
    /// One permit per running operation. Closed on shutdown.
    in_flight: Semaphore,
}

impl<B: BackingStore> SortFs<B> {
    /// Present `backing` sorted according to `config`.
    pub fn new(backing: B, config: SortConfig) -> Self {
        Self {
            snapshots: SnapshotCache::new(config.freshness),
            config: Arc::new(config),
            backing,
            handles: HandleTable::new(),
            in_flight: Semaphore::new(MAX_IN_FLIGHT as usize),
        }
    }

    /// The configuration this view was built with.
    #[must_use]
    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// The snapshot cache.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    /// Number of live file and directory handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    async fn begin(&self) -> Result<SemaphorePermit<'_>, FsError> {
        self.in_flight
            .acquire()
            .await
            .map_err(|_| FsError::ShuttingDown)
    }

    /// Compare a fresh stat of `parent/name` with the parent's published
    /// listing and invalidate the listing if they disagree.
    ///
    /// `fresh` is `None` when the backing store reported the entry absent.
    fn reconcile(&self, parent: &VPath, name: &OsStr, fresh: Option<&Entry>) {
        let Some(listing) = self.snapshots.cached(parent) else {
            return;
        };
        let stale = match (listing.get(name), fresh) {
            (None, None) => false,
            (Some(cached), Some(fresh)) => !cached.same_version(fresh),
            (Some(_), None) | (None, Some(_)) => true,
        };
        if stale {
            debug!(%parent, ?name, "listing disagrees with backing store");
            self.snapshots.invalidate(parent);
        }
    }

    /// Stat `path` and reconcile the result with the parent's listing.
    ///
    /// `ENOTDIR` from the backing store means an ancestor is not a
    /// directory, so the path does not exist: it is reported as `NotFound`.
    async fn stat_reconciled(&self, path: &VPath) -> Result<Entry, FsError> {
        let result = match self.backing.stat(path).await.map_err(FsError::from) {
            Err(FsError::NotADirectory) => Err(FsError::NotFound),
            other => other,
        };
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            match &result {
                Ok(entry) => self.reconcile(&parent, name, Some(entry)),
                Err(FsError::NotFound) => self.reconcile(&parent, name, None),
                Err(_) => {}
            }
        }
        result
    }

    /// List, sort and verify `path`. A listing that fails verification is
    /// discarded and recomputed once.
    async fn build_listing(&self, path: &VPath) -> Result<SortedListing, FsError> {
        let order = &self.config.order;
        let entries = self.backing.list(path).await?;
        let listing = sort::order(path.clone(), entries, order);
        let Err(first) = sort::verify(&listing, order) else {
            return Ok(listing);
        };
        error!(%path, error = %first, "discarding inconsistent listing, recomputing");

        let entries = self.backing.list(path).await?;
        let listing = sort::order(path.clone(), entries, order);
        if let Err(second) = sort::verify(&listing, order) {
            error!(%path, error = %second, "recomputed listing is still inconsistent");
            return Err(second);
        }
        Ok(listing)
    }

    async fn load_listing(&self, path: &VPath) -> Result<Arc<SortedListing>, FsError> {
        let result = self
            .snapshots
            .get_or_refresh(path, || self.build_listing(path))
            .await;
        if let Err(FsError::NotFound | FsError::NotADirectory) = &result
            && self.snapshots.evict(path)
        {
            trace!(%path, "evicted snapshot slot for missing directory");
        }
        result
    }

    /// Resolve `name` inside `parent`.
    ///
    /// Always stats the backing store, so a path that no longer exists is
    /// `NotFound` even while the parent's listing still names it. Names that
    /// cannot be members of a directory (`.`, `..`, empty, containing `/`)
    /// are `NotFound` too.
    #[instrument(level = "debug", skip(self))]
    pub async fn lookup(&self, parent: &VPath, name: &OsStr) -> Result<Entry, FsError> {
        let _op = self.begin().await?;
        let path = parent.join(name).map_err(|_| FsError::NotFound)?;
        self.stat_reconciled(&path).await
    }

    /// Metadata of the object at `path`.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_attributes(&self, path: &VPath) -> Result<Entry, FsError> {
        let _op = self.begin().await?;
        self.stat_reconciled(path).await
    }

    /// The sorted listing of the directory at `path`.
    #[instrument(level = "debug", skip(self))]
    pub async fn list_directory(&self, path: &VPath) -> Result<Arc<SortedListing>, FsError> {
        let _op = self.begin().await?;
        self.load_listing(path).await
    }

    /// Open the regular file at `path` for reading.
    #[instrument(level = "debug", skip(self))]
    pub async fn open(&self, path: &VPath, flags: OpenFlags) -> Result<Handle, FsError> {
        let _op = self.begin().await?;
        if !flags.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        let entry = self.backing.stat(path).await?;
        match entry.kind {
            EntryKind::File => {}
            EntryKind::Directory => return Err(FsError::IsADirectory),
            EntryKind::Symlink | EntryKind::Other => return Err(FsError::PermissionDenied),
        }
        let reader = self.backing.open(path, &entry).await?;
        let handle = self.handles.create(OpenResource::File {
            path: path.clone(),
            reader,
        })?;
        debug!(handle = handle.into_raw(), "opened file");
        Ok(handle)
    }

    /// Open the directory at `path`, pinning its current listing.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_directory(&self, path: &VPath, flags: OpenFlags) -> Result<Handle, FsError> {
        let _op = self.begin().await?;
        if !flags.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        let entry = self.backing.stat(path).await?;
        if entry.kind != EntryKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let listing = self.load_listing(path).await?;
        let handle = self.handles.create(OpenResource::Directory {
            path: path.clone(),
            listing,
        })?;
        debug!(handle = handle.into_raw(), "opened directory");
        Ok(handle)
    }

    /// Read up to `size` bytes at `offset` from an open file.
    ///
    /// Short only at end-of-file. The resource stays alive until the read
    /// finishes even if the handle is released concurrently.
    #[instrument(level = "debug", skip(self, handle), fields(handle = handle.into_raw()))]
    pub async fn read(
        &self,
        handle: Handle,
        offset: u64,
        size: u32,
    ) -> Result<bytes::Bytes, FsError> {
        let _op = self.begin().await?;
        let resource = self.handles.resolve(handle).ok_or(FsError::InvalidHandle)?;
        match resource.as_ref() {
            OpenResource::File { reader, .. } => Ok(reader.read(offset, size).await?),
            OpenResource::Directory { .. } => Err(FsError::IsADirectory),
        }
    }

    /// The listing pinned by an open directory handle.
    pub async fn read_directory(&self, handle: Handle) -> Result<Arc<SortedListing>, FsError> {
        let _op = self.begin().await?;
        let resource = self.handles.resolve(handle).ok_or(FsError::InvalidHandle)?;
        match resource.as_ref() {
            OpenResource::Directory { listing, .. } => Ok(Arc::clone(listing)),
            OpenResource::File { .. } => Err(FsError::NotADirectory),
        }
    }

    /// Release a file or directory handle.
    ///
    /// Never fails, and works during shutdown. Returns `false` when the
    /// handle was already released.
    pub fn release(&self, handle: Handle) -> bool {
        let released = self.handles.destroy(handle);
        if !released {
            trace!(handle = handle.into_raw(), "release of unknown handle ignored");
        }
        released
    }

    /// Target of the symlink at `path`. `InvalidArgument` if it is not one.
    #[instrument(level = "debug", skip(self))]
    pub async fn read_link(&self, path: &VPath) -> Result<std::ffi::OsString, FsError> {
        let _op = self.begin().await?;
        Ok(self.backing.read_link(path).await?)
    }

    /// Capacity statistics of the backing store.
    pub async fn statfs(&self) -> Result<FsStats, FsError> {
        let _op = self.begin().await?;
        Ok(self.backing.statfs().await?)
    }

    /// Force the next listing of `path` to consult the backing store.
    pub fn invalidate(&self, path: &VPath) -> bool {
        self.snapshots.invalidate(path)
    }

    /// Refuse new operations and wait for the running ones to finish.
    ///
    /// Idempotent. Handles stay valid for `release`.
    pub async fn shutdown(&self) {
        match self.in_flight.acquire_many(MAX_IN_FLIGHT).await {
            Ok(permits) => {
                permits.forget();
                self.in_flight.close();
                debug!(open_handles = self.handles.len(), "all operations drained");
            }
            Err(_) => warn!("shutdown requested twice"),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has completed.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.in_flight.is_closed()
    }
}
