//! Inode numbers for the FUSE boundary.
//!
//! The sorted view is addressed by [`VPath`]; the kernel addresses nodes by
//! inode number. [`InodeMap`] assigns numbers to paths on first sight and
//! [`InodeLifecycle`] drops them again once the kernel has forgotten every
//! lookup it was told about.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::{InodeAddr, VPath};
use crate::drop_ward::{DropWard, StatelessDrop};

/// Inode number of the mount root.
pub const ROOT_INO: InodeAddr = 1;

/// Bidirectional inode <-> path mapping.
///
/// Reads go straight to the concurrent maps. Mutations touching both maps are
/// serialized by `mu`.
pub struct InodeMap {
    by_ino: scc::HashMap<InodeAddr, VPath>,
    by_path: scc::HashMap<VPath, InodeAddr>,
    mu: Mutex<()>,
    next: AtomicU64,
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeMap {
    /// A map containing only the root.
    #[must_use]
    pub fn new() -> Self {
        let map = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            mu: Mutex::new(()),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        let _ = map.by_ino.insert_sync(ROOT_INO, VPath::root());
        let _ = map.by_path.insert_sync(VPath::root(), ROOT_INO);
        map
    }

    /// The path behind `ino`.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<VPath> {
        self.by_ino.read_sync(&ino, |_, p| p.clone())
    }

    /// The inode number already assigned to `path`, if any. Never allocates.
    #[must_use]
    pub fn peek(&self, path: &VPath) -> Option<InodeAddr> {
        self.by_path.read_sync(path, |_, &ino| ino)
    }

    /// The inode number for `path`, allocating one if the path is new.
    pub fn ino_for(&self, path: &VPath) -> InodeAddr {
        if let Some(ino) = self.peek(path) {
            return ino;
        }
        let _guard = self.mu.lock();
        match self.by_path.entry_sync(path.clone()) {
            scc::hash_map::Entry::Occupied(occ) => *occ.get(),
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                let _ = self.by_ino.insert_sync(ino, path.clone());
                ino
            }
        }
    }

    /// Forget `ino`. The root is never removed.
    pub fn remove(&self, ino: InodeAddr) -> bool {
        if ino == ROOT_INO {
            return false;
        }
        let _guard = self.mu.lock();
        match self.by_ino.remove_sync(&ino) {
            Some((_, path)) => {
                self.by_path.remove_sync(&path);
                true
            }
            None => false,
        }
    }

    /// Number of mapped inodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Always `false`: the root is permanently mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

/// Removes an inode from the [`InodeMap`] once its lookup count hits zero.
pub struct PathForget;

impl StatelessDrop<Arc<InodeMap>, InodeAddr> for PathForget {
    fn delete(ctx: &Arc<InodeMap>, key: &InodeAddr) {
        if ctx.remove(*key) {
            trace!(ino = key, "inode forgotten");
        }
    }
}

/// Kernel lookup-count bookkeeping on top of an [`InodeMap`].
///
/// Every entry reply increments the count for its inode; `forget` decrements
/// it. The map and the counts change under one lock, so a lookup racing a
/// forget of the same path either revives the old number before it is
/// dropped or allocates a new one after.
pub struct InodeLifecycle {
    map: Arc<InodeMap>,
    ward: Mutex<DropWard<Arc<InodeMap>, InodeAddr, PathForget>>,
}

impl Default for InodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeLifecycle {
    /// Start with only the root mapped.
    #[must_use]
    pub fn new() -> Self {
        let map = Arc::new(InodeMap::new());
        Self {
            ward: Mutex::new(DropWard::new(Arc::clone(&map))),
            map,
        }
    }

    /// The underlying map.
    #[must_use]
    pub fn map(&self) -> &InodeMap {
        &self.map
    }

    /// The path behind `ino`.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<VPath> {
        self.map.path(ino)
    }

    /// Map `path` and count one kernel reference to it.
    pub fn acquire(&self, path: &VPath) -> InodeAddr {
        let mut ward = self.ward.lock();
        let ino = self.map.ino_for(path);
        ward.inc(ino);
        ino
    }

    /// The inode number to report for `path` in a directory listing.
    ///
    /// `readdir` does not add kernel references, so nothing would ever
    /// forget a number allocated here. Paths the kernel already knows keep
    /// their number; others report `backing_ino` and stay unmapped until
    /// looked up.
    #[must_use]
    pub fn listing_ino(&self, path: &VPath, backing_ino: u64) -> InodeAddr {
        self.map.peek(path).unwrap_or(backing_ino)
    }

    /// Drop `nlookup` kernel references to `ino`.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        let count = usize::try_from(nlookup).unwrap_or(usize::MAX);
        let _ = self.ward.lock().dec_count(&ino, count);
    }
}
