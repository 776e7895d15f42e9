//! The filesystem dispatch layer.
//!
//! `Filesys` owns all mutable state for one mount and translates kernel
//! requests into metadata, prefetch, and upload operations. The
//! `fuser::Filesystem` impl at the bottom is a thin shim: it bridges the
//! kernel's callback threads into the async engine with a runtime handle
//! and maps error kinds onto errnos. Everything above the shim is plain
//! async Rust, exercised directly by the integration tests.
//!
//! Locking: the handle tables sit behind one mutex, the metadata index
//! serializes internally, and the prefetch/upload subsystems carry their
//! own locks. No lock is held across a remote call; describes and URL
//! mints run first, and their results merge back under a short critical
//! section.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fuser::{FileAttr, FileType};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::runtime::Handle;

use dxfuse_common::{
    split_path, Error, Manifest, Result, DIR_READ_ONLY_MODE, DIR_READ_WRITE_MODE,
    FILE_READ_ONLY_MODE, FILE_WRITABLE_MODE, MAX_NUM_FILE_HANDLES,
};
use dxfuse_metadata::{Dir, File, FolderSource, MetadataDb, Node, ObjKind};
use dxfuse_platform::{
    DownloadUrl, FileState, FolderContents, PlatformClient, ProjectDescriptor,
    ProjectPermission, RangeFetcher,
};

use crate::options::Options;
use crate::prefetch::{PrefetchConfig, Prefetcher, UrlSource};
use crate::upload::{IndexUpdater, RemoteUploader, UploadConfig, UploadState, Uploader};

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn timestamp(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

// ============================================================================
// Capability adapters
//
// Each subsystem receives a narrow view of the platform client or the
// metadata index instead of the whole filesystem. This keeps the
// dependency graph acyclic and lets every subsystem run against fakes.
// ============================================================================

struct ClientFolderSource {
    client: Arc<dyn PlatformClient>,
}

#[async_trait]
impl FolderSource for ClientFolderSource {
    async fn describe_folder(&self, project_id: &str, folder: &str) -> Result<FolderContents> {
        self.client.describe_folder(project_id, folder).await
    }
}

struct ClientUrlSource {
    client: Arc<dyn PlatformClient>,
}

#[async_trait]
impl UrlSource for ClientUrlSource {
    async fn download_url(&self, file_id: &str, project_id: &str) -> Result<DownloadUrl> {
        self.client.file_download_url(file_id, project_id).await
    }
}

struct ClientUploader {
    client: Arc<dyn PlatformClient>,
}

#[async_trait]
impl RemoteUploader for ClientUploader {
    async fn upload_part(&self, file_id: &str, index: u32, data: Vec<u8>) -> Result<()> {
        self.client.file_upload_part(file_id, index, &data).await
    }

    async fn close_file(&self, file_id: &str) -> Result<()> {
        self.client.file_close(file_id).await
    }

    async fn file_status(&self, file_id: &str) -> Result<(FileState, i64)> {
        let desc = self.client.file_describe(file_id).await?;
        Ok((desc.state, desc.size))
    }
}

struct MdbIndexUpdater {
    mdb: Arc<MetadataDb>,
}

impl IndexUpdater for MdbIndexUpdater {
    fn finalize_file(&self, inode: i64, size: i64, mtime: i64) -> Result<()> {
        self.mdb.finalize_new_file(inode, size, mtime)
    }
}

// ============================================================================
// Handles
// ============================================================================

enum FileHandleKind {
    /// Immutable remote file, served through the prefetcher.
    RemoteReadOnly,
    /// Open descriptor on a local copy (staging file of a file still
    /// uploading, or inlined content).
    LocalCopyReadOnly { fd: std::fs::File },
    /// Staging descriptor of a newly created file; append-only.
    NewlyCreatedReadWrite { fd: std::fs::File, size: u64 },
}

struct FileHandle {
    inode: i64,
    kind: FileHandleKind,
}

/// The listing is materialized at opendir so enumeration stays stable
/// across readdir calls on the same open.
#[derive(Clone)]
struct DirHandle {
    entries: Vec<(u64, FileType, String)>,
}

#[derive(Default)]
struct HandleTables {
    file_handles: HashMap<u64, FileHandle>,
    file_free: Vec<u64>,
    next_file_id: u64,
    dir_handles: HashMap<u64, DirHandle>,
    dir_free: Vec<u64>,
    next_dir_id: u64,
}

impl HandleTables {
    fn alloc_file(&mut self, handle: FileHandle) -> Result<u64> {
        if self.file_handles.len() >= MAX_NUM_FILE_HANDLES {
            return Err(Error::IO("file handle table is full".to_string()));
        }
        let id: u64 = match self.file_free.pop() {
            Some(id) => id,
            None => {
                self.next_file_id += 1;
                self.next_file_id
            }
        };
        self.file_handles.insert(id, handle);
        Ok(id)
    }

    fn free_file(&mut self, id: u64) -> Option<FileHandle> {
        let handle: Option<FileHandle> = self.file_handles.remove(&id);
        if handle.is_some() {
            self.file_free.push(id);
        }
        handle
    }

    fn alloc_dir(&mut self, handle: DirHandle) -> u64 {
        let id: u64 = match self.dir_free.pop() {
            Some(id) => id,
            None => {
                self.next_dir_id += 1;
                self.next_dir_id
            }
        };
        self.dir_handles.insert(id, handle);
        id
    }

    fn free_dir(&mut self, id: u64) -> Option<DirHandle> {
        let handle: Option<DirHandle> = self.dir_handles.remove(&id);
        if handle.is_some() {
            self.dir_free.push(id);
        }
        handle
    }
}

// ============================================================================
// The engine
// ============================================================================

/// One mounted filesystem: the root context owning every subsystem.
pub struct Filesys {
    runtime: Handle,
    options: Options,
    mdb: Arc<MetadataDb>,
    client: Arc<dyn PlatformClient>,
    source: ClientFolderSource,
    prefetch: Prefetcher,
    uploader: Uploader,
    /// Mounted projects by id; the create path consults permissions.
    projects: HashMap<String, ProjectDescriptor>,
    /// Local base directory -> project id, longest path first.
    base_dirs: Vec<(String, String)>,
    handles: Mutex<HandleTables>,
    /// Monotonic counter naming staging files.
    staging_counter: AtomicU64,
    shutdown_called: AtomicBool,
}

impl Filesys {
    /// Build the engine for one mount with default subsystem tuning.
    pub async fn new(
        client: Arc<dyn PlatformClient>,
        fetcher: Arc<dyn RangeFetcher>,
        manifest: &Manifest,
        options: Options,
    ) -> Result<Filesys> {
        Self::new_with_tuning(
            client,
            fetcher,
            manifest,
            options,
            PrefetchConfig::default(),
            UploadConfig::default(),
        )
        .await
    }

    /// Build the engine with explicit subsystem tuning; tests shrink the
    /// windows and part sizes through this.
    pub async fn new_with_tuning(
        client: Arc<dyn PlatformClient>,
        fetcher: Arc<dyn RangeFetcher>,
        manifest: &Manifest,
        options: Options,
        prefetch_config: PrefetchConfig,
        upload_config: UploadConfig,
    ) -> Result<Filesys> {
        let runtime: Handle =
            Handle::try_current().map_err(|e| Error::IO(format!("no tokio runtime: {}", e)))?;

        // The namespace is rebuilt from the platform on every mount.
        if options.database_file.exists() {
            std::fs::remove_file(&options.database_file)?;
        }
        if let Some(parent) = options.database_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&options.staging_dir)?;

        let mdb = Arc::new(MetadataDb::open(&options.database_file)?);
        manifest.validate()?;
        mdb.bootstrap(manifest)?;

        // Describe every mounted project up front; file creation needs
        // the permission level.
        let mut projects: HashMap<String, ProjectDescriptor> = HashMap::new();
        for d in &manifest.directories {
            if !projects.contains_key(&d.proj_id) {
                let desc: ProjectDescriptor = client.describe_project(&d.proj_id).await?;
                projects.insert(d.proj_id.clone(), desc);
            }
        }

        let mut base_dirs: Vec<(String, String)> = manifest.base_dirs();
        base_dirs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let prefetch = Prefetcher::new(
            fetcher,
            Arc::new(ClientUrlSource {
                client: client.clone(),
            }),
            prefetch_config,
        );
        let uploader = Uploader::new(
            Arc::new(ClientUploader {
                client: client.clone(),
            }),
            Arc::new(MdbIndexUpdater { mdb: mdb.clone() }),
            upload_config,
        );

        Ok(Filesys {
            runtime,
            options,
            mdb,
            source: ClientFolderSource {
                client: client.clone(),
            },
            client,
            prefetch,
            uploader,
            projects,
            base_dirs,
            handles: Mutex::new(HandleTables::default()),
            staging_counter: AtomicU64::new(0),
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Drain uploads and cancel prefetches. Idempotent; called on
    /// unmount and on fatal errors.
    pub async fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down: draining uploads");
        self.prefetch.shutdown();
        self.uploader.drain(self.options.drain_timeout).await;
        self.uploader.shutdown();
    }

    // ========================================================================
    // Attribute synthesis
    // ========================================================================

    fn dir_attr(&self, d: &Dir) -> FileAttr {
        let perm: u16 = if self.options.read_only {
            DIR_READ_ONLY_MODE
        } else {
            DIR_READ_WRITE_MODE
        };
        FileAttr {
            ino: d.inode as u64,
            size: 4096,
            blocks: 8,
            atime: timestamp(d.mtime),
            mtime: timestamp(d.mtime),
            ctime: timestamp(d.ctime),
            crtime: timestamp(d.ctime),
            kind: FileType::Directory,
            perm,
            nlink: 1,
            uid: self.options.uid,
            gid: self.options.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, f: &File) -> FileAttr {
        // A file mid-write reports its live staged size.
        let size: u64 = self
            .uploader
            .current_size(f.inode)
            .unwrap_or(f.size.max(0) as u64);
        let kind: FileType = match f.kind {
            ObjKind::Symlink => FileType::Symlink,
            _ => FileType::RegularFile,
        };
        let writable: bool = matches!(self.uploader.state_of(f.inode), Some(UploadState::Open));
        let perm: u16 = if writable {
            FILE_WRITABLE_MODE
        } else {
            FILE_READ_ONLY_MODE
        };
        FileAttr {
            ino: f.inode as u64,
            size,
            blocks: (size + 511) / 512,
            atime: timestamp(f.mtime),
            mtime: timestamp(f.mtime),
            ctime: timestamp(f.ctime),
            crtime: timestamp(f.ctime),
            kind,
            perm,
            nlink: f.nlink.max(1) as u32,
            uid: self.options.uid,
            gid: self.options.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn node_attr(&self, node: &Node) -> FileAttr {
        match node {
            Node::Directory(d) => self.dir_attr(d),
            Node::DataObject(f) => self.file_attr(f),
        }
    }

    /// The backing project and remote folder for a local directory,
    /// by longest-prefix match against the mounted base directories.
    fn project_and_folder(&self, dir_path: &str) -> Result<(String, String)> {
        for (base, proj_id) in &self.base_dirs {
            if dir_path == base {
                return Ok((proj_id.clone(), "/".to_string()));
            }
            if dir_path.starts_with(base.as_str())
                && dir_path.as_bytes().get(base.len()) == Some(&b'/')
            {
                return Ok((proj_id.clone(), dir_path[base.len()..].to_string()));
            }
        }
        Err(Error::PermissionDenied(format!(
            "{} is not backed by any mounted project",
            dir_path
        )))
    }

    // ========================================================================
    // Engine operations
    // ========================================================================

    pub async fn op_lookup(&self, parent: u64, name: &str) -> Result<FileAttr> {
        let parent_path: String = self.mdb.dir_path(parent as i64)?;
        let node: Node = self.mdb.lookup(&parent_path, name, &self.source).await?;
        Ok(self.node_attr(&node))
    }

    pub fn op_getattr(&self, ino: u64) -> Result<FileAttr> {
        let node: Node = self.mdb.node_by_inode(ino as i64)?;
        Ok(self.node_attr(&node))
    }

    pub fn op_readlink(&self, ino: u64) -> Result<Vec<u8>> {
        match self.mdb.node_by_inode(ino as i64)? {
            Node::DataObject(f) if f.kind == ObjKind::Symlink => Ok(f.inline_data.into_bytes()),
            _ => Err(Error::NotSupported("not a symbolic link".to_string())),
        }
    }

    /// List a directory and snapshot the result into a new handle.
    pub async fn op_opendir(&self, ino: u64) -> Result<u64> {
        let dir_path: String = self.mdb.dir_path(ino as i64)?;
        let (files, subdirs) = self.mdb.readdir(&dir_path, &self.source).await?;

        let parent_ino: u64 = if dir_path == "/" {
            ino
        } else {
            let (parent_path, _) = split_path(&dir_path);
            match self.mdb.directory_lookup(parent_path)? {
                dxfuse_metadata::DirStatus::Populated(d)
                | dxfuse_metadata::DirStatus::Unpopulated(d) => d.inode as u64,
                dxfuse_metadata::DirStatus::Missing => ino,
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        let mut names: Vec<&String> = subdirs.keys().collect();
        names.sort_unstable();
        for name in names {
            entries.push((
                subdirs[name].inode as u64,
                FileType::Directory,
                name.clone(),
            ));
        }
        let mut names: Vec<&String> = files.keys().collect();
        names.sort_unstable();
        for name in names {
            let f: &File = &files[name];
            let kind: FileType = match f.kind {
                ObjKind::Symlink => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            entries.push((f.inode as u64, kind, name.clone()));
        }

        let mut tables = self.handles.lock().unwrap();
        Ok(tables.alloc_dir(DirHandle { entries }))
    }

    /// Entries from `offset` onward, out of the opendir snapshot.
    pub fn op_readdir(&self, fh: u64, offset: i64) -> Result<Vec<(u64, FileType, String)>> {
        let tables = self.handles.lock().unwrap();
        let handle: &DirHandle = tables.dir_handles.get(&fh).ok_or(Error::NotFound)?;
        Ok(handle
            .entries
            .iter()
            .skip(offset.max(0) as usize)
            .cloned()
            .collect())
    }

    pub fn op_releasedir(&self, fh: u64) -> Result<()> {
        self.handles
            .lock()
            .unwrap()
            .free_dir(fh)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    pub async fn op_open(&self, ino: u64, flags: i32) -> Result<u64> {
        let f: File = match self.mdb.node_by_inode(ino as i64)? {
            Node::DataObject(f) => f,
            Node::Directory(_) => {
                return Err(Error::NotSupported("open on a directory".to_string()))
            }
        };
        let accmode: i32 = flags & libc::O_ACCMODE;

        // Files still in flight through the upload subsystem.
        match self.uploader.state_of(f.inode) {
            Some(UploadState::Open) | Some(UploadState::Sealing) => {
                if let Some(err) = self.uploader.error_of(f.inode) {
                    return Err(err);
                }
                if accmode != libc::O_RDONLY {
                    return Err(Error::NotSupported(
                        "newly created files take writes only through the creating handle"
                            .to_string(),
                    ));
                }
                let fd: std::fs::File = std::fs::File::open(&f.inline_data)?;
                let mut tables = self.handles.lock().unwrap();
                return tables.alloc_file(FileHandle {
                    inode: f.inode,
                    kind: FileHandleKind::LocalCopyReadOnly { fd },
                });
            }
            Some(UploadState::Closing) => {
                // Visible again once the platform reports it closed.
                return Err(Error::IO(format!("{} is still closing", f.name)));
            }
            Some(UploadState::Failed) => {
                return Err(self
                    .uploader
                    .error_of(f.inode)
                    .unwrap_or_else(|| Error::IO("upload failed".to_string())));
            }
            Some(UploadState::Closed) | None => {}
        }

        if accmode != libc::O_RDONLY {
            return Err(Error::PermissionDenied(
                "remote files are immutable".to_string(),
            ));
        }
        match f.kind {
            ObjKind::Regular => {}
            ObjKind::Symlink => {
                return Err(Error::NotSupported("open on a symbolic link".to_string()))
            }
            _ => {
                return Err(Error::NotSupported(format!(
                    "{} is not a downloadable object",
                    f.id
                )))
            }
        }

        if !f.inline_data.is_empty() {
            // Local copy left over from an earlier create.
            let fd: std::fs::File = std::fs::File::open(&f.inline_data)?;
            let mut tables = self.handles.lock().unwrap();
            return tables.alloc_file(FileHandle {
                inode: f.inode,
                kind: FileHandleKind::LocalCopyReadOnly { fd },
            });
        }

        // Remote read: mint the download URL with no lock held, then
        // wire the handle into the prefetcher.
        let url: DownloadUrl = self.client.file_download_url(&f.id, &f.proj_id).await?;
        let fh: u64 = {
            let mut tables = self.handles.lock().unwrap();
            tables.alloc_file(FileHandle {
                inode: f.inode,
                kind: FileHandleKind::RemoteReadOnly,
            })?
        };
        self.prefetch
            .open(fh, &f.id, &f.proj_id, f.size.max(0) as u64, url);
        Ok(fh)
    }

    pub async fn op_read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        enum Backing {
            Remote,
            Local(std::fs::File),
        }

        let (inode, backing) = {
            let tables = self.handles.lock().unwrap();
            let handle: &FileHandle = tables.file_handles.get(&fh).ok_or(Error::NotFound)?;
            let backing: Backing = match &handle.kind {
                FileHandleKind::RemoteReadOnly => Backing::Remote,
                FileHandleKind::LocalCopyReadOnly { fd }
                | FileHandleKind::NewlyCreatedReadWrite { fd, .. } => {
                    Backing::Local(fd.try_clone()?)
                }
            };
            (handle.inode, backing)
        };

        if let Some(err) = self.uploader.error_of(inode) {
            return Err(err);
        }

        match backing {
            Backing::Remote => self.prefetch.read(fh, offset.max(0) as u64, size).await,
            Backing::Local(fd) => pread(&fd, offset.max(0) as u64, size),
        }
    }

    /// Create a new file under a writable project directory and return
    /// its attributes plus an open writable handle.
    pub async fn op_create(&self, parent: u64, name: &str) -> Result<(FileAttr, u64)> {
        if self.options.read_only {
            return Err(Error::PermissionDenied("read-only mount".to_string()));
        }
        let parent_path: String = self.mdb.dir_path(parent as i64)?;
        let (proj_id, folder) = self.project_and_folder(&parent_path)?;

        // Permission check strictly before any remote traffic.
        let project: &ProjectDescriptor = self
            .projects
            .get(&proj_id)
            .ok_or_else(|| Error::Corrupt(format!("project {} was never described", proj_id)))?;
        if project.level < ProjectPermission::Upload {
            return Err(Error::PermissionDenied(format!(
                "project {} does not grant upload",
                project.name
            )));
        }

        match self.mdb.lookup(&parent_path, name, &self.source).await {
            Ok(_) => return Err(Error::Exists),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        // Stage locally first. Counter plus nonce keeps names unique
        // across racing creates and across mounts sharing the directory.
        let counter: u64 = self.staging_counter.fetch_add(1, Ordering::SeqCst);
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let staging_path: PathBuf = self
            .options
            .staging_dir
            .join(format!("{}_{}", counter, nonce));
        let fd: std::fs::File = std::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&staging_path)?;

        let file_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let file_id: String = match self
            .client
            .file_new(&proj_id, name, &folder, &file_nonce)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = std::fs::remove_file(&staging_path);
                return Err(e);
            }
        };

        let now: i64 = now_seconds();
        let inode: i64 = self.mdb.create_data_object(
            ObjKind::Regular,
            &proj_id,
            &file_id,
            0,
            now,
            now,
            &parent_path,
            name,
            &staging_path.to_string_lossy(),
        )?;
        self.uploader.register(inode, &file_id, &staging_path);

        let attr: FileAttr = self.file_attr(&File {
            kind: ObjKind::Regular,
            id: file_id,
            proj_id,
            name: name.to_string(),
            size: 0,
            inode,
            ctime: now,
            mtime: now,
            nlink: 1,
            inline_data: staging_path.to_string_lossy().into_owned(),
        });

        let fh: u64 = {
            let mut tables = self.handles.lock().unwrap();
            tables.alloc_file(FileHandle {
                inode,
                kind: FileHandleKind::NewlyCreatedReadWrite { fd, size: 0 },
            })?
        };
        Ok((attr, fh))
    }

    /// Append-only write into the staging file of a newly created file.
    pub fn op_write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32> {
        let mut tables = self.handles.lock().unwrap();
        let handle: &mut FileHandle =
            tables.file_handles.get_mut(&fh).ok_or(Error::NotFound)?;
        let inode: i64 = handle.inode;

        match &mut handle.kind {
            FileHandleKind::NewlyCreatedReadWrite { fd, size } => {
                if let Some(err) = self.uploader.error_of(inode) {
                    return Err(err);
                }
                if offset.max(0) as u64 != *size {
                    return Err(Error::NotSupported(
                        "random writes to a newly created file".to_string(),
                    ));
                }
                fd.write_all_at(data, *size)?;
                *size += data.len() as u64;
                self.uploader.append(inode, data.len() as u64)?;
                Ok(data.len() as u32)
            }
            _ => Err(Error::PermissionDenied("read-only handle".to_string())),
        }
    }

    /// Drop a file handle. Writable files start their finalization in
    /// the background; the kernel gets its reply immediately.
    pub fn op_release(&self, fh: u64) -> Result<()> {
        let handle: FileHandle = self
            .handles
            .lock()
            .unwrap()
            .free_file(fh)
            .ok_or(Error::NotFound)?;
        match handle.kind {
            FileHandleKind::RemoteReadOnly => self.prefetch.close(fh),
            FileHandleKind::LocalCopyReadOnly { .. } => {}
            FileHandleKind::NewlyCreatedReadWrite { .. } => {
                self.uploader.schedule_finalize(handle.inode);
            }
        }
        Ok(())
    }

    /// Map an error to the errno reported to the kernel. Corruption is
    /// fatal: the index can no longer be trusted, so the process drains
    /// uploads and exits.
    fn errno_of(&self, err: &Error) -> libc::c_int {
        if err.is_fatal() {
            tracing::error!("fatal metadata error: {}", err);
            self.runtime.block_on(self.shutdown());
            std::process::exit(1);
        }
        err.errno()
    }
}

fn pread(fd: &std::fs::File, offset: u64, size: u32) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = vec![0u8; size as usize];
    let mut total: usize = 0;
    while total < buf.len() {
        let n: usize = fd.read_at(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);
    Ok(buf)
}

// ============================================================================
// FUSE shim
// ============================================================================

/// TTL handed to the kernel for entries and attributes.
const TTL: Duration = Duration::from_secs(1);

impl fuser::Filesystem for Filesys {
    fn lookup(
        &mut self,
        _req: &fuser::Request,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let name: &str = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.runtime.clone().block_on(self.op_lookup(parent, name)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &fuser::Request, ino: u64, reply: fuser::ReplyAttr) {
        match self.op_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &fuser::Request, ino: u64, reply: fuser::ReplyData) {
        match self.op_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn opendir(&mut self, _req: &fuser::Request, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        match self.runtime.clone().block_on(self.op_opendir(ino)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let entries: Vec<(u64, FileType, String)> = match self.op_readdir(fh, offset) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(self.errno_of(&e));
                return;
            }
        };
        for (i, (ino, kind, name)) in entries.iter().enumerate() {
            let cookie: i64 = offset + i as i64 + 1;
            if reply.add(*ino, cookie, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        match self.op_releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &fuser::Request, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        match self.runtime.clone().block_on(self.op_open(ino, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        match self.runtime.clone().block_on(self.op_read(fh, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &fuser::Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let name: &str = match name.to_str() {
            Some(n) => n,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self.runtime.clone().block_on(self.op_create(parent, name)) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &fuser::Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        match self.op_write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        match self.op_release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(self.errno_of(&e)),
        }
    }

    // The mutating surface beyond create/write is deliberately small.
    fn mkdir(
        &mut self,
        _req: &fuser::Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn unlink(&mut self, _req: &fuser::Request, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn rmdir(&mut self, _req: &fuser::Request, _parent: u64, _name: &OsStr, reply: fuser::ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn rename(
        &mut self,
        _req: &fuser::Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request,
        _parent: u64,
        _link_name: &OsStr,
        _target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn destroy(&mut self) {
        self.runtime.clone().block_on(self.shutdown());
    }
}
