//! Persistent metadata index for a dxfuse mount.
//!
//! The index is a single SQLite file holding the namespace tree, inode
//! assignments, data-object descriptors, and directory population state.
//! Remote structure is discovered lazily: a directory's children are
//! described on first access, reshaped into POSIX-compatible entries, and
//! committed in one transaction.

pub mod db;
pub mod node;
pub mod posix;

pub use db::{DirStatus, FolderSource, MetadataDb};
pub use node::{Dir, File, Node, ObjKind};
pub use posix::PosixDir;
