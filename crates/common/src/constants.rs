//! Shared constants used across the dxfuse crates.

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Default location of the persistent metadata store.
pub const DATABASE_FILE: &str = "/var/dxfuse/metadata.db";

/// Default staging directory for newly created files.
pub const CREATED_FILES_DIR: &str = "/var/dxfuse/created_files";

/// Default log destination for the mount daemon.
pub const LOG_FILE: &str = "/var/log/dxfuse.log";

/// Number of pooled HTTP clients for short platform requests
/// (describe, file-new, close).
pub const HTTP_CLIENT_POOL_SIZE: usize = 4;

/// Largest folder listing the metadata index will accept. Bigger folders
/// surface an unsupported-operation error instead of being silently
/// truncated.
pub const MAX_DIR_SIZE: usize = 10_000;

/// Upper bound on concurrently open file handles.
pub const MAX_NUM_FILE_HANDLES: usize = 1_000_000;

/// Default retry count for remote calls.
pub const NUM_RETRIES_DEFAULT: u32 = 3;

/// Tail size at which a part is sliced off a staging file and queued for
/// upload. Part indices start at 1.
pub const UPLOAD_PART_SIZE: u64 = 16 * MIB;

/// Number of background upload workers.
pub const UPLOAD_WORKERS: usize = 4;

/// How long unmount waits for in-flight uploads to drain, in seconds.
pub const UPLOAD_DRAIN_TIMEOUT_SECS: u64 = 600;

/// Initial prefetch window; doubles while reads stay sequential.
pub const PREFETCH_MIN_WINDOW: u64 = MIB;

/// Prefetch window growth stops here.
pub const PREFETCH_MAX_WINDOW: u64 = 16 * MIB;

/// Global byte budget for prefetched chunks across all handles.
pub const PREFETCH_MEMORY_BUDGET: u64 = 256 * MIB;

/// Number of background prefetch workers.
pub const PREFETCH_WORKERS: usize = 4;

/// Reserved inode of the mount root.
pub const INODE_ROOT: i64 = 1;

/// Sentinel for "no such inode".
pub const INODE_INVALID: i64 = 0;

// Regular users must be able to create files under writable project
// directories, which requires 777 on the directory itself.
pub const DIR_READ_WRITE_MODE: u16 = 0o777;
pub const DIR_READ_ONLY_MODE: u16 = 0o555;
pub const FILE_READ_ONLY_MODE: u16 = 0o444;
pub const FILE_WRITABLE_MODE: u16 = 0o644;
