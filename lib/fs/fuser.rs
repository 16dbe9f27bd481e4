//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`SortFs`].
//!
//! fuser invokes callbacks one at a time on its session thread. Every
//! callback that may touch the backing store resolves its inode up front and
//! then moves the reply into a task on the tokio runtime, so slow I/O on one
//! path never holds up requests for another.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument as _, debug, error, instrument, warn};

use super::backing::BackingStore;
use super::inodes::{InodeLifecycle, ROOT_INO};
use super::{Entry, EntryKind, FsError, Handle, InodeAddr, OpenFlags, SortFs, VPath};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyStatfs,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(FsError::Internal(msg)) => {
                error!(%msg, "invariant violated, replying EIO");
                reply.error(libc::EIO);
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

fn entry_kind_to_fuser(kind: EntryKind) -> fuser::FileType {
    match kind {
        EntryKind::Directory => fuser::FileType::Directory,
        EntryKind::Symlink => fuser::FileType::Symlink,
        EntryKind::File | EntryKind::Other => fuser::FileType::RegularFile,
    }
}

/// Convert an [`Entry`] to the fuser-specific `FileAttr` under inode `ino`.
fn entry_to_fuser_attr(ino: InodeAddr, entry: &Entry) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: entry.size,
        blocks: entry.size.div_ceil(512),
        atime: entry.modified,
        mtime: entry.modified,
        ctime: entry.modified,
        crtime: entry.modified,
        kind: entry_kind_to_fuser(entry.kind),
        perm: entry.permissions.bits(),
        nlink: entry.nlink,
        uid: entry.uid,
        gid: entry.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

const BLOCK_SIZE: u32 = 4096;

/// Bridges a [`SortFs`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<B: BackingStore> {
    fs: Arc<SortFs<B>>,
    inodes: Arc<InodeLifecycle>,
    attr_ttl: Duration,
    runtime: tokio::runtime::Handle,
}

impl<B: BackingStore> FuserAdapter<B> {
    /// Serve `fs`, telling the kernel to cache attributes for `attr_ttl`.
    ///
    /// Requests are executed on `runtime`.
    pub fn new(fs: Arc<SortFs<B>>, attr_ttl: Duration, runtime: tokio::runtime::Handle) -> Self {
        Self {
            fs,
            inodes: Arc::new(InodeLifecycle::new()),
            attr_ttl,
            runtime,
        }
    }

    /// The dispatcher behind this adapter.
    #[must_use]
    pub fn fs(&self) -> &Arc<SortFs<B>> {
        &self.fs
    }

    fn path_of(&self, ino: InodeAddr) -> Option<VPath> {
        let path = self.inodes.path(ino);
        if path.is_none() {
            warn!(ino, "request for unknown inode");
        }
        path
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.runtime.spawn(task.in_current_span());
    }
}

impl<B: BackingStore> fuser::Filesystem for FuserAdapter<B> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = match parent_path.join(name) {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, "invalid name");
                reply.error(libc::ENOENT);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let ttl = self.attr_ttl;
        let name = name.to_os_string();
        self.spawn(async move {
            fs.lookup(&parent_path, &name)
                .await
                .fuse_reply(reply, |entry, reply| {
                    let ino = inodes.acquire(&path);
                    let attr = entry_to_fuser_attr(ino, &entry);
                    debug!(?attr, "replying...");
                    reply.entry(&ttl, &attr, 0);
                });
        });
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);
        let ttl = self.attr_ttl;
        self.spawn(async move {
            fs.get_attributes(&path)
                .await
                .fuse_reply(reply, |entry, reply| {
                    let attr = entry_to_fuser_attr(ino, &entry);
                    debug!(?attr, "replying...");
                    reply.attr(&ttl, &attr);
                });
        });
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            fs.read_link(&path).await.fuse_reply(reply, |target, reply| {
                debug!(?target, "replying...");
                reply.data(target.as_bytes());
            });
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let flags = OpenFlags::from_bits_retain(flags);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            fs.open(&path, flags).await.fuse_reply(reply, |handle, reply| {
                debug!(handle = handle.into_raw(), "replying...");
                reply.opened(handle.into_raw(), 0);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            fs.read(Handle::from_raw(fh), offset, size)
                .await
                .fuse_reply(reply, |data, reply| {
                    debug!(read_bytes = data.len(), "replying...");
                    reply.data(&data);
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(Handle::from_raw(fh));
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, reply))]
    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let flags = OpenFlags::from_bits_retain(flags);
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            fs.open_directory(&path, flags)
                .await
                .fuse_reply(reply, |handle, reply| {
                    debug!(handle = handle.into_raw(), "replying...");
                    reply.opened(handle.into_raw(), 0);
                });
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: fuser::ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Ok(skip) = usize::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.spawn(async move {
            fs.read_directory(Handle::from_raw(fh))
                .await
                .fuse_reply(reply, |listing, mut reply| {
                    let parent_ino = path
                        .parent()
                        .and_then(|parent| inodes.map().peek(&parent))
                        .unwrap_or(ROOT_INO);
                    let dots = [
                        (ino, fuser::FileType::Directory, OsStr::new(".")),
                        (parent_ino, fuser::FileType::Directory, OsStr::new("..")),
                    ];
                    let children = listing.iter().filter_map(|entry| {
                        let child = path.join(&entry.name).ok()?;
                        Some((
                            inodes.listing_ino(&child, entry.id.ino),
                            entry_kind_to_fuser(entry.kind),
                            entry.name.as_os_str(),
                        ))
                    });

                    for (i, (entry_ino, kind, name)) in
                        dots.into_iter().chain(children).enumerate().skip(skip)
                    {
                        let Ok(next) = i64::try_from(i + 1) else {
                            error!(index = i, "directory entry index too large for fuser");
                            reply.error(libc::EIO);
                            return;
                        };
                        if reply.add(entry_ino, next, kind, name) {
                            debug!("buffer full for now, stopping readdir");
                            break;
                        }
                    }
                    debug!("finalizing reply...");
                    reply.ok();
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::releasedir",
        skip(self, _req, _ino, _flags, reply)
    )]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(Handle::from_raw(fh));
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            fs.statfs().await.fuse_reply(reply, |stats, reply| {
                debug!(?stats, "replying...");
                reply.statfs(
                    stats.total_blocks,
                    stats.free_blocks,
                    stats.available_blocks,
                    stats.total_inodes,
                    stats.free_inodes,
                    stats.block_size,
                    stats.max_filename_length,
                    stats.fragment_size,
                );
            });
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::destroy", skip(self))]
    fn destroy(&mut self) {
        self.runtime.block_on(self.fs.shutdown());
        debug!(
            open_handles = self.fs.open_handles(),
            inodes = self.inodes.map().len(),
            "filesystem destroyed"
        );
    }
}
