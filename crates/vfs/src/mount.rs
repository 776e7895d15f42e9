//! Mount and session management for the kernel bridge.
//!
//! Writeback caching stays disabled (fuser's default): the upload path
//! is append-only and depends on writes arriving in program order.

use std::path::Path;

use fuser::{BackgroundSession, MountOption};

use dxfuse_common::{Error, Result};

use crate::fs::Filesys;

fn mount_options(read_only: bool) -> Vec<MountOption> {
    let mut opts: Vec<MountOption> = vec![
        MountOption::FSName("dxfuse".to_string()),
        // Jobs run tools under different uids than the mount daemon.
        MountOption::AllowOther,
        MountOption::AutoUnmount,
    ];
    if read_only {
        opts.push(MountOption::RO);
    }
    opts
}

/// Mount and serve until the filesystem is unmounted. Upload draining
/// happens in the session teardown path.
pub fn mount_foreground(fsys: Filesys, mountpoint: &Path, read_only: bool) -> Result<()> {
    fuser::mount2(fsys, mountpoint, &mount_options(read_only))
        .map_err(|e| Error::IO(format!("mount failed: {}", e)))
}

/// Mount in the background; the returned session unmounts on drop.
pub fn spawn_mount(
    fsys: Filesys,
    mountpoint: &Path,
    read_only: bool,
) -> Result<BackgroundSession> {
    fuser::spawn_mount2(fsys, mountpoint, &mount_options(read_only))
        .map_err(|e| Error::IO(format!("mount failed: {}", e)))
}
