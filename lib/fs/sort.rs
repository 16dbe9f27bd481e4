//! The sort engine.
//!
//! Orders a raw set of [`Entry`] values with the configured comparator and
//! wraps the result in an immutable [`SortedListing`]. All metadata needed for
//! comparison is already in the entries, so sorting never touches the
//! backing store.

use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt as _;
use std::str::FromStr;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::{Entry, EntryKind, FsError, VPath};

/// Which piece of metadata drives the order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortKey {
    /// Byte-wise name order.
    #[default]
    Name,
    /// File size in bytes.
    Size,
    /// Last modification time.
    #[serde(alias = "modified")]
    Mtime,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "size" => Ok(Self::Size),
            "mtime" | "modified" | "time" => Ok(Self::Mtime),
            other => Err(format!(
                "unknown sort key '{other}', expected one of: name, size, mtime"
            )),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Name => "name",
            Self::Size => "size",
            Self::Mtime => "mtime",
        })
    }
}

/// Whether the key sorts low-to-high or high-to-low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortDirection {
    /// Smallest key first.
    #[default]
    #[serde(alias = "asc")]
    Ascending,
    /// Largest key first.
    #[serde(alias = "desc")]
    Descending,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            other => Err(format!(
                "unknown sort direction '{other}', expected ascending or descending"
            )),
        }
    }
}

/// The comparator, fixed for the lifetime of a mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SortOrder {
    /// The primary key.
    pub key: SortKey,
    /// Direction applied to the primary key.
    pub direction: SortDirection,
    /// Group directories ahead of every other kind before comparing keys.
    pub directories_first: bool,
}

impl SortOrder {
    /// Build an order on `key` in `direction`, without directory grouping.
    #[must_use]
    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        Self {
            key,
            direction,
            directories_first: false,
        }
    }

    /// Total order over entries.
    ///
    /// Entries that compare equal on the key fall back to ascending name
    /// order, independent of `direction`, so the result is reproducible.
    #[must_use]
    pub fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        let group = if self.directories_first {
            dir_rank(a).cmp(&dir_rank(b))
        } else {
            Ordering::Equal
        };

        let key = match self.key {
            SortKey::Name => name_cmp(&a.name, &b.name),
            SortKey::Size => a.size.cmp(&b.size),
            SortKey::Mtime => a.modified.cmp(&b.modified),
        };
        let key = match self.direction {
            SortDirection::Ascending => key,
            SortDirection::Descending => key.reverse(),
        };

        group
            .then(key)
            .then_with(|| name_cmp(&a.name, &b.name))
    }
}

fn dir_rank(e: &Entry) -> u8 {
    u8::from(e.kind != EntryKind::Directory)
}

fn name_cmp(a: &OsStr, b: &OsStr) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

/// An ordered, immutable snapshot of one directory.
///
/// Built once by [`order`] and then only ever shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct SortedListing {
    path: VPath,
    entries: Vec<Entry>,
    /// name -> position in `entries`.
    index: FxHashMap<OsString, usize>,
}

impl SortedListing {
    /// The directory this listing describes.
    #[must_use]
    pub fn path(&self) -> &VPath {
        &self.path
    }

    /// The entries, in presentation order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Iterate entries in presentation order.
    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Entry names in presentation order.
    pub fn names(&self) -> impl Iterator<Item = &OsStr> {
        self.entries.iter().map(|e| e.name.as_os_str())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry called `name`, if the directory had one at snapshot time.
    #[must_use]
    pub fn get(&self, name: &OsStr) -> Option<&Entry> {
        self.position(name).and_then(|i| self.entries.get(i))
    }

    /// Position of `name` in presentation order.
    #[must_use]
    pub fn position(&self, name: &OsStr) -> Option<usize> {
        self.index.get(name).copied()
    }
}

impl<'a> IntoIterator for &'a SortedListing {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Sort `entries` for `path` under `by`.
///
/// Uses a stable O(n log n) sort. Does not check uniqueness; run [`verify`]
/// before publishing the result.
#[must_use]
pub fn order(path: VPath, mut entries: Vec<Entry>, by: &SortOrder) -> SortedListing {
    entries.sort_by(|a, b| by.compare(a, b));
    let index = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.name.clone(), i))
        .collect();
    SortedListing {
        path,
        entries,
        index,
    }
}

/// Check that `listing` is strictly increasing under `order`, has unique
/// names, and that its name index agrees with its entries.
pub fn verify(listing: &SortedListing, order: &SortOrder) -> Result<(), FsError> {
    if listing.index.len() != listing.entries.len() {
        return Err(FsError::Internal(format!(
            "listing of {} has duplicate names ({} entries, {} distinct)",
            listing.path,
            listing.entries.len(),
            listing.index.len()
        )));
    }
    for pair in listing.entries.windows(2) {
        if let [a, b] = pair
            && order.compare(a, b) != Ordering::Less
        {
            return Err(FsError::Internal(format!(
                "listing of {} is out of order at {:?} / {:?}",
                listing.path, a.name, b.name
            )));
        }
    }
    for (i, e) in listing.entries.iter().enumerate() {
        if listing.index.get(&e.name) != Some(&i) {
            return Err(FsError::Internal(format!(
                "listing of {} has a stale index for {:?}",
                listing.path, e.name
            )));
        }
    }
    Ok(())
}
