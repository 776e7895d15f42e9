//! Descriptor types and traits for the remote platform.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use dxfuse_common::Result;

/// A URL minted by the platform for ranged downloads of one file.
///
/// The headers must accompany every GET on the URL. The URL expires;
/// holders refresh it through [`PlatformClient::file_download_url`].
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadUrl {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// One data object as reported by a folder describe.
///
/// The id prefix (`file-`, `applet-`, `workflow-`, `record-`,
/// `database-`) carries the object type.
#[derive(Debug, Clone)]
pub struct DataObjectDescriptor {
    pub id: String,
    pub proj_id: String,
    pub name: String,
    pub size: i64,
    /// Seconds since the Unix epoch.
    pub ctime: i64,
    pub mtime: i64,
    /// Set when the object is a symbolic link; holds the target.
    pub symlink_path: Option<String>,
}

/// The direct contents of one remote folder.
#[derive(Debug, Clone, Default)]
pub struct FolderContents {
    pub data_objects: Vec<DataObjectDescriptor>,
    /// Names of direct subfolders, without the leading path.
    pub subdirs: Vec<String>,
}

/// Access level the credentials hold on a project. Ordering matters:
/// file creation requires at least [`ProjectPermission::Upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProjectPermission {
    View,
    Upload,
    Contribute,
    Administer,
}

impl ProjectPermission {
    pub fn parse(level: &str) -> ProjectPermission {
        match level {
            "UPLOAD" => ProjectPermission::Upload,
            "CONTRIBUTE" => ProjectPermission::Contribute,
            "ADMINISTER" => ProjectPermission::Administer,
            _ => ProjectPermission::View,
        }
    }
}

/// Project attributes the filesystem needs at bootstrap.
#[derive(Debug, Clone)]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    pub level: ProjectPermission,
    pub ctime: i64,
    pub mtime: i64,
}

/// Lifecycle of a remote file. Newly created files are `Open`, transit
/// `Closing` once sealed, and become immutable at `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Closing,
    Closed,
}

impl FileState {
    pub fn parse(state: &str) -> FileState {
        match state {
            "closed" => FileState::Closed,
            "closing" => FileState::Closing,
            _ => FileState::Open,
        }
    }
}

/// Per-file describe result, used while waiting for a close to land.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub id: String,
    pub proj_id: String,
    pub name: String,
    pub size: i64,
    pub state: FileState,
    pub ctime: i64,
    pub mtime: i64,
}

/// The platform operations the filesystem core consumes.
///
/// Implementations retry transient failures internally with bounded
/// exponential backoff; only final failures surface.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Describe a project: name, permission level, timestamps.
    async fn describe_project(&self, project_id: &str) -> Result<ProjectDescriptor>;

    /// List the direct contents of one folder. Paginates internally and
    /// returns the complete listing.
    async fn describe_folder(&self, project_id: &str, folder: &str) -> Result<FolderContents>;

    /// Create a new, open remote file. The nonce makes the call
    /// idempotent across retries.
    async fn file_new(
        &self,
        project_id: &str,
        name: &str,
        folder: &str,
        nonce: &str,
    ) -> Result<String>;

    /// Upload one part of an open file. Part indices start at 1.
    async fn file_upload_part(&self, file_id: &str, index: u32, data: &[u8]) -> Result<()>;

    /// Seal an open file. The platform transitions it to `closing` and
    /// eventually `closed`.
    async fn file_close(&self, file_id: &str) -> Result<()>;

    /// Describe one file; used to poll for the `closed` transition.
    async fn file_describe(&self, file_id: &str) -> Result<FileDescriptor>;

    /// Mint a fresh ranged-download URL for a file.
    async fn file_download_url(&self, file_id: &str, project_id: &str) -> Result<DownloadUrl>;

    /// Resolve a project name to its id, if any project matches.
    async fn find_project(&self, name: &str) -> Result<Option<String>>;
}

/// Ranged HTTP download of file bytes, separated from [`PlatformClient`]
/// so the prefetcher can be tested against an in-memory fake.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Fetch `[offset, offset + len)` from a download URL.
    async fn fetch_range(&self, url: &DownloadUrl, offset: u64, len: u64) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_ordering() {
        assert!(ProjectPermission::View < ProjectPermission::Upload);
        assert!(ProjectPermission::Upload < ProjectPermission::Contribute);
        assert!(ProjectPermission::parse("CONTRIBUTE") >= ProjectPermission::Upload);
        assert!(ProjectPermission::parse("VIEW") < ProjectPermission::Upload);
    }

    #[test]
    fn test_file_state_parse() {
        assert_eq!(FileState::parse("closed"), FileState::Closed);
        assert_eq!(FileState::parse("closing"), FileState::Closing);
        assert_eq!(FileState::parse("open"), FileState::Open);
    }
}
