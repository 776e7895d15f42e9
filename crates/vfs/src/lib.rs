//! The dxfuse I/O engine and FUSE dispatch layer.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: FUSE interface (fuser::Filesystem impl in fs.rs)
//! Layer 2: engine operations (lookup, readdir, open, read, create, ...)
//! Layer 1: subsystems (MetadataDb, Prefetcher, Uploader)
//! ```
//!
//! The engine owns all mutable state for one mount: the metadata index,
//! the prefetch and upload subsystems, the handle tables, and the
//! project map. Subsystems receive narrow capability objects (a range
//! fetcher, a URL source, a remote uploader, an index updater) rather
//! than the whole filesystem, so each can be exercised against fakes.

pub mod fs;
pub mod mount;
pub mod options;
pub mod prefetch;
pub mod upload;

pub use fs::Filesys;
pub use mount::{mount_foreground, spawn_mount};
pub use options::Options;
pub use prefetch::{PrefetchConfig, Prefetcher, UrlSource};
pub use upload::{IndexUpdater, RemoteUploader, UploadConfig, UploadState, Uploader};
