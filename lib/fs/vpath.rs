use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Reasons a string cannot be turned into a [`VPath`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path does not start at the root.
    #[error("path is not absolute")]
    NotAbsolute,

    /// The path contains a `..` component.
    #[error("path contains a parent-directory component")]
    ParentComponent,

    /// A single name is empty, `.`, `..`, or contains a `/` or NUL byte.
    #[error("invalid entry name {0:?}")]
    InvalidName(std::ffi::OsString),
}

/// A normalized location in the virtual tree.
///
/// Always absolute, never contains `.` or `..`, never has a trailing slash
/// (except the root itself). Cheap to clone, so it doubles as the key for
/// the snapshot cache and the inode map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VPath(Arc<Path>);

impl VPath {
    /// The root of the virtual tree, `/`.
    #[must_use]
    pub fn root() -> Self {
        Self(Arc::from(Path::new("/")))
    }

    /// Normalize `path` into a [`VPath`].
    ///
    /// Repeated slashes and `.` components are dropped. `..` is refused
    /// rather than resolved, since resolving it lexically could step outside
    /// the directory it was meant to be relative to.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self, PathError> {
        let mut components = path.as_ref().components();
        if components.next() != Some(Component::RootDir) {
            return Err(PathError::NotAbsolute);
        }
        let mut out = PathBuf::from("/");
        for component in components {
            match component {
                Component::Normal(name) => out.push(name),
                Component::CurDir => {}
                Component::ParentDir => return Err(PathError::ParentComponent),
                Component::RootDir | Component::Prefix(_) => return Err(PathError::NotAbsolute),
            }
        }
        Ok(Self(Arc::from(out)))
    }

    /// The child of this path called `name`.
    pub fn join(&self, name: &OsStr) -> Result<Self, PathError> {
        let bytes = name.as_bytes();
        let reserved = bytes.is_empty() || bytes == b"." || bytes == b"..";
        if reserved || bytes.contains(&b'/') || bytes.contains(&0) {
            return Err(PathError::InvalidName(name.to_os_string()));
        }
        Ok(Self(Arc::from(self.0.join(name))))
    }

    /// The parent directory, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|p| Self(Arc::from(p)))
    }

    /// The final component, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    /// Whether this is `/`.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.parent().is_none()
    }

    /// Borrow as a [`Path`].
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The path relative to the root, suitable for joining onto a backing
    /// directory. Empty for the root.
    #[must_use]
    pub fn relative(&self) -> &Path {
        self.0.strip_prefix("/").unwrap_or(&self.0)
    }
}

impl fmt::Display for VPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
