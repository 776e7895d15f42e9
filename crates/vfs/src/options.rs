//! Mount-wide options for the filesystem engine.

use std::path::PathBuf;
use std::time::Duration;

use dxfuse_common::{CREATED_FILES_DIR, DATABASE_FILE, UPLOAD_DRAIN_TIMEOUT_SECS};

/// Options controlling one mount.
#[derive(Debug, Clone)]
pub struct Options {
    /// Refuse all file creation.
    pub read_only: bool,
    /// 0 is quiet; higher values enable progressively noisier logging.
    pub verbose_level: u32,
    /// Owner reported for every node.
    pub uid: u32,
    pub gid: u32,
    /// Location of the metadata store. Recreated on every mount.
    pub database_file: PathBuf,
    /// Directory holding staging files for newly created files.
    pub staging_dir: PathBuf,
    /// How long unmount waits for uploads to drain.
    pub drain_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            verbose_level: 0,
            uid: 0,
            gid: 0,
            database_file: PathBuf::from(DATABASE_FILE),
            staging_dir: PathBuf::from(CREATED_FILES_DIR),
            drain_timeout: Duration::from_secs(UPLOAD_DRAIN_TIMEOUT_SECS),
        }
    }
}

impl Options {
    /// Relocate all on-disk state under one directory. Used by tests and
    /// unprivileged mounts.
    pub fn with_state_dir(mut self, dir: &std::path::Path) -> Self {
        self.database_file = dir.join("metadata.db");
        self.staging_dir = dir.join("created_files");
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}
