use thiserror::Error;

use super::vpath::PathError;

/// Every way an operation on the sorted view can fail.
///
/// Backing-store errors are classified by errno so that the kernel sees the
/// same code the backing filesystem reported.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not exist in the backing store.
    #[error("not found")]
    NotFound,

    /// The backing store refused access, or a write was requested.
    #[error("permission denied")]
    PermissionDenied,

    /// The handle is unknown, already released, or its backing object was
    /// replaced.
    #[error("invalid handle")]
    InvalidHandle,

    /// A directory operation named something else.
    #[error("not a directory")]
    NotADirectory,

    /// A file operation named a directory.
    #[error("is a directory")]
    IsADirectory,

    /// For example `readlink` on something that is not a symlink.
    #[error("invalid argument")]
    InvalidArgument,

    /// A cache or listing invariant was violated.
    #[error("internal inconsistency: {0}")]
    Internal(String),

    /// Shutdown has begun; no new operations are accepted.
    #[error("filesystem is shutting down")]
    ShuttingDown,

    /// Any other backing-store failure, carrying its errno.
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl FsError {
    /// The errno to report to the kernel.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::InvalidHandle => libc::EBADF,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::InvalidArgument => libc::EINVAL,
            Self::Internal(_) => libc::EIO,
            Self::ShuttingDown => libc::ESHUTDOWN,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOENT) => return Self::NotFound,
            Some(libc::EACCES | libc::EPERM) => return Self::PermissionDenied,
            Some(libc::ENOTDIR) => return Self::NotADirectory,
            Some(libc::EISDIR) => return Self::IsADirectory,
            Some(libc::ESTALE | libc::EBADF) => return Self::InvalidHandle,
            Some(libc::EINVAL) => return Self::InvalidArgument,
            Some(_) => return Self::Io(e),
            None => {}
        }
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(e),
        }
    }
}

impl From<PathError> for FsError {
    fn from(_: PathError) -> Self {
        Self::InvalidArgument
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_by_errno() {
        let cases = [
            (libc::ENOENT, libc::ENOENT),
            (libc::EPERM, libc::EACCES),
            (libc::ENOTDIR, libc::ENOTDIR),
            (libc::EISDIR, libc::EISDIR),
            (libc::ESTALE, libc::EBADF),
            (libc::EINVAL, libc::EINVAL),
            (libc::ENOSPC, libc::ENOSPC),
        ];
        for (raw, expected) in cases {
            let err = FsError::from(std::io::Error::from_raw_os_error(raw));
            assert_eq!(err.errno(), expected, "errno {raw}");
        }
    }

    #[test]
    fn errorless_io_falls_back_to_eio() {
        let err = FsError::from(std::io::Error::other("boom"));
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(FsError::ShuttingDown.errno(), libc::ESHUTDOWN);
    }
}
