//! FUSE availability checks, run before attempting to mount.

use std::path::Path;

#[cfg(target_os = "linux")]
const FUSE_DEVICE: &str = "/dev/fuse";

#[cfg(target_os = "macos")]
const MACFUSE_FS_BUNDLE: &str = "/Library/Filesystems/macfuse.fs";

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel module is not loaded or the device node is missing.
    #[cfg(target_os = "linux")]
    #[error(
        "FUSE device {path} not found. Load the fuse kernel module (`modprobe fuse`) or, in a \
         container, pass the device through."
    )]
    DeviceMissing {
        /// Where the device was expected.
        path: &'static str,
    },

    /// The device exists but cannot be opened by this user.
    #[cfg(target_os = "linux")]
    #[error("FUSE device {path} is not accessible: {source}")]
    DeviceInaccessible {
        /// The device node.
        path: &'static str,
        /// Why opening it failed.
        source: std::io::Error,
    },

    /// macFUSE is not installed at all.
    #[cfg(target_os = "macos")]
    #[error(
        "macFUSE is not installed. sort-fuse requires macFUSE to mount filesystems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    NotInstalled,
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new(FUSE_DEVICE).exists() {
        return Err(FuseCheckError::DeviceMissing { path: FUSE_DEVICE });
    }
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(FUSE_DEVICE)
        .map(drop)
        .map_err(|source| FuseCheckError::DeviceInaccessible {
            path: FUSE_DEVICE,
            source,
        })
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if Path::new(MACFUSE_FS_BUNDLE).is_dir() {
        Ok(())
    } else {
        Err(FuseCheckError::NotInstalled)
    }
}
