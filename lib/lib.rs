//! sort-fuse shared library.

pub mod drop_ward;
/// Sorted directory view, its caches, and the FUSE adapter.
pub mod fs;
