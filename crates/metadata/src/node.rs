//! Filesystem node model: directories and data objects.

use dxfuse_common::{Error, Result};

/// What a data object is, derived from its id prefix. A regular file
/// carrying a symlink path is reported as a symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Regular,
    Symlink,
    Applet,
    Workflow,
    Record,
    Database,
    Other,
}

impl ObjKind {
    /// Classify a remote data object.
    pub fn of_data_object(id: &str, symlink_path: Option<&str>) -> ObjKind {
        let kind: ObjKind = if id.starts_with("file-") {
            ObjKind::Regular
        } else if id.starts_with("applet-") {
            ObjKind::Applet
        } else if id.starts_with("workflow-") {
            ObjKind::Workflow
        } else if id.starts_with("record-") {
            ObjKind::Record
        } else if id.starts_with("database-") {
            ObjKind::Database
        } else {
            tracing::warn!("data object has an unknown id prefix ({})", id);
            ObjKind::Other
        };

        if kind == ObjKind::Regular && symlink_path.map_or(false, |p| !p.is_empty()) {
            ObjKind::Symlink
        } else {
            kind
        }
    }

    pub fn to_db(self) -> i64 {
        match self {
            ObjKind::Regular => 10,
            ObjKind::Symlink => 11,
            ObjKind::Applet => 12,
            ObjKind::Workflow => 13,
            ObjKind::Record => 14,
            ObjKind::Database => 15,
            ObjKind::Other => 16,
        }
    }

    pub fn from_db(value: i64) -> Result<ObjKind> {
        match value {
            10 => Ok(ObjKind::Regular),
            11 => Ok(ObjKind::Symlink),
            12 => Ok(ObjKind::Applet),
            13 => Ok(ObjKind::Workflow),
            14 => Ok(ObjKind::Record),
            15 => Ok(ObjKind::Database),
            16 => Ok(ObjKind::Other),
            other => Err(Error::Corrupt(format!("unknown object kind {}", other))),
        }
    }
}

/// A data object exposed as a file. Could stand for a workflow or an
/// applet just as well as a regular file; the kind tells them apart.
#[derive(Debug, Clone)]
pub struct File {
    pub kind: ObjKind,
    /// Remote id, required to mint download URLs.
    pub id: String,
    /// Project or container holding the object.
    pub proj_id: String,
    pub name: String,
    pub size: i64,
    pub inode: i64,
    /// Seconds since the Unix epoch.
    pub ctime: i64,
    pub mtime: i64,
    pub nlink: i64,
    /// Symlink target for symlinks, local staging path for newly created
    /// files, empty otherwise.
    pub inline_data: String,
}

/// A directory in the namespace tree.
#[derive(Debug, Clone)]
pub struct Dir {
    /// Parent path; empty only for the root.
    pub parent: String,
    /// Final path component.
    pub dname: String,
    pub full_path: String,
    pub inode: i64,
    /// Approximated from child timestamps; the platform records no
    /// per-folder times.
    pub ctime: i64,
    pub mtime: i64,
    /// Backing project, empty for synthetic directories.
    pub proj_id: String,
    pub proj_folder: String,
    pub populated: bool,
}

/// A resolved namespace entry.
#[derive(Debug, Clone)]
pub enum Node {
    Directory(Dir),
    DataObject(File),
}

impl Node {
    pub fn inode(&self) -> i64 {
        match self {
            Node::Directory(d) => d.inode,
            Node::DataObject(f) => f.inode,
        }
    }
}
