//! Filesystem types shared by the sorted view and its adapters.
/// Backing store abstraction and the local-directory implementation.
pub mod backing;
/// Error taxonomy and errno projection.
pub mod error;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`sort_fs::SortFs`].
pub mod fuser;
/// Generation-checked handle arena.
pub mod handles;
/// Inode number <-> path mapping for the FUSE boundary.
pub mod inodes;
/// Per-directory snapshot cache of sorted listings.
pub mod snapshot;
/// Comparators and the immutable sorted listing.
pub mod sort;
/// The operation dispatcher.
pub mod sort_fs;
/// Normalized virtual paths.
pub mod vpath;

pub use error::FsError;
pub use handles::Handle;
pub use sort::{SortDirection, SortKey, SortOrder, SortedListing};
pub use sort_fs::{SortConfig, SortFs};
pub use vpath::VPath;

use std::ffi::OsString;
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode number handed to the kernel.
pub type InodeAddr = u64;

bitflags! {
    /// Permission bits of an entry, as in the low twelve bits of `st_mode`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;
        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;
        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;
        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;
    }
}

impl InodePerms {
    /// Extract the permission bits from a raw `st_mode`.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to twelve bits before the cast"
        )]
        let bits = (mode & 0o7777) as u16;
        Self::from_bits_truncate(bits)
    }
}

bitflags! {
    /// Flags passed to `open(2)` as seen by the kernel-facing layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// Whether the access mode requests reading only.
    ///
    /// `RDONLY` is zero, so this inspects the `O_ACCMODE` bits rather than
    /// calling `contains`.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        self.bits() & libc::O_ACCMODE == libc::O_RDONLY
            && !self.intersects(Self::APPEND | Self::TRUNC | Self::CREAT)
    }
}

/// The kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A FIFO, socket or device node.
    Other,
}

/// Identity of an object in the backing store (`st_dev`, `st_ino`).
///
/// Two stats of the same path that disagree on this identity refer to
/// different objects: the path was replaced between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackingId {
    /// Device the object lives on.
    pub dev: u64,
    /// Inode number within that device.
    pub ino: u64,
}

/// One named member of a directory, with the metadata the sort engine and
/// the kernel need.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Name within the parent directory. Empty for the root.
    pub name: OsString,
    /// What kind of object this is.
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Permission bits.
    pub permissions: InodePerms,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Backing-store identity, used to detect replacement.
    pub id: BackingId,
}

impl Entry {
    /// Whether `other` describes the same version of the same object.
    ///
    /// Used to decide whether a cached listing still agrees with a fresh stat.
    #[must_use]
    pub fn same_version(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.size == other.size
            && self.modified == other.modified
    }
}

/// Filesystem statistics returned by [`SortFs::statfs`].
///
/// Block counts are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Fragment size (bytes).
    pub fragment_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes.
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
