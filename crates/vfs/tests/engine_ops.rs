//! End-to-end engine scenarios against an in-memory platform.
//!
//! The fake platform serves folder listings, mints fake download URLs,
//! accepts multi-part uploads, and flips files to `closed` when asked,
//! so every scenario runs without a network or a kernel mount.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use dxfuse_common::{Error, Manifest, ManifestDirectory, Result, KIB};
use dxfuse_platform::{
    DataObjectDescriptor, DownloadUrl, FileDescriptor, FileState, FolderContents,
    PlatformClient, ProjectDescriptor, ProjectPermission, RangeFetcher,
};
use dxfuse_vfs::{Filesys, Options, PrefetchConfig, UploadConfig};

struct CreatedFile {
    name: String,
    parts: BTreeMap<u32, Vec<u8>>,
    state: FileState,
}

/// The whole remote platform, in memory.
#[derive(Default)]
struct FakePlatform {
    projects: HashMap<String, ProjectDescriptor>,
    folders: HashMap<(String, String), FolderContents>,
    /// Byte content of immutable remote files, by file id.
    remote_data: Mutex<HashMap<String, Vec<u8>>>,
    created: Mutex<HashMap<String, CreatedFile>>,
    folder_describes: AtomicU32,
    file_news: AtomicU32,
    next_file_id: AtomicU32,
}

impl FakePlatform {
    fn add_project(&mut self, id: &str, name: &str, level: ProjectPermission) {
        self.projects.insert(
            id.to_string(),
            ProjectDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                level,
                ctime: 1_600_000_000,
                mtime: 1_600_000_000,
            },
        );
    }

    fn add_folder(&mut self, proj: &str, folder: &str, contents: FolderContents) {
        self.folders
            .insert((proj.to_string(), folder.to_string()), contents);
    }

    fn seed_file(&self, file_id: &str, data: Vec<u8>) {
        self.remote_data
            .lock()
            .unwrap()
            .insert(file_id.to_string(), data);
    }

    fn created_state(&self, name: &str) -> Option<(FileState, usize)> {
        let created = self.created.lock().unwrap();
        created
            .values()
            .find(|f| f.name == name)
            .map(|f| (f.state, f.parts.values().map(|p| p.len()).sum()))
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn describe_project(&self, project_id: &str) -> Result<ProjectDescriptor> {
        self.projects
            .get(project_id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn describe_folder(&self, project_id: &str, folder: &str) -> Result<FolderContents> {
        self.folder_describes.fetch_add(1, Ordering::SeqCst);
        self.folders
            .get(&(project_id.to_string(), folder.to_string()))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn file_new(
        &self,
        _project_id: &str,
        name: &str,
        _folder: &str,
        _nonce: &str,
    ) -> Result<String> {
        self.file_news.fetch_add(1, Ordering::SeqCst);
        let n: u32 = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let file_id: String = format!("file-new{:04}", n);
        self.created.lock().unwrap().insert(
            file_id.clone(),
            CreatedFile {
                name: name.to_string(),
                parts: BTreeMap::new(),
                state: FileState::Open,
            },
        );
        Ok(file_id)
    }

    async fn file_upload_part(&self, file_id: &str, index: u32, data: &[u8]) -> Result<()> {
        let mut created = self.created.lock().unwrap();
        let file: &mut CreatedFile = created.get_mut(file_id).ok_or(Error::NotFound)?;
        file.parts.insert(index, data.to_vec());
        Ok(())
    }

    async fn file_close(&self, file_id: &str) -> Result<()> {
        let assembled: Vec<u8> = {
            let mut created = self.created.lock().unwrap();
            let file: &mut CreatedFile = created.get_mut(file_id).ok_or(Error::NotFound)?;
            file.state = FileState::Closed;
            file.parts.values().flatten().copied().collect()
        };
        self.remote_data
            .lock()
            .unwrap()
            .insert(file_id.to_string(), assembled);
        Ok(())
    }

    async fn file_describe(&self, file_id: &str) -> Result<FileDescriptor> {
        let created = self.created.lock().unwrap();
        let file: &CreatedFile = created.get(file_id).ok_or(Error::NotFound)?;
        let size: usize = file.parts.values().map(|p| p.len()).sum();
        Ok(FileDescriptor {
            id: file_id.to_string(),
            proj_id: "project-1111".to_string(),
            name: file.name.clone(),
            size: size as i64,
            state: file.state,
            ctime: 0,
            mtime: 0,
        })
    }

    async fn file_download_url(&self, file_id: &str, _project_id: &str) -> Result<DownloadUrl> {
        Ok(DownloadUrl {
            url: format!("fake://{}", file_id),
            headers: HashMap::new(),
        })
    }

    async fn find_project(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
impl RangeFetcher for FakePlatform {
    async fn fetch_range(&self, url: &DownloadUrl, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file_id: &str = url
            .url
            .strip_prefix("fake://")
            .ok_or_else(|| Error::IO(format!("unexpected URL {}", url.url)))?;
        let data = self.remote_data.lock().unwrap();
        let bytes: &Vec<u8> = data.get(file_id).ok_or(Error::NotFound)?;
        let start: usize = offset as usize;
        let end: usize = (offset + len) as usize;
        if end > bytes.len() {
            return Err(Error::IO(format!(
                "range [{}, {}) outside {} bytes",
                start,
                end,
                bytes.len()
            )));
        }
        Ok(bytes[start..end].to_vec())
    }
}

fn obj(id: &str, name: &str, size: i64) -> DataObjectDescriptor {
    DataObjectDescriptor {
        id: id.to_string(),
        proj_id: "project-1111".to_string(),
        name: name.to_string(),
        size,
        ctime: 1_600_000_100,
        mtime: 1_600_000_200,
        symlink_path: None,
    }
}

fn alpha_manifest() -> Manifest {
    Manifest {
        files: vec![],
        directories: vec![ManifestDirectory {
            proj_id: "project-1111".to_string(),
            folder: "/".to_string(),
            dirname: "/alpha".to_string(),
            ctime: 1_600_000_000,
            mtime: 1_600_000_000,
        }],
    }
}

async fn make_fs(fake: Arc<FakePlatform>, manifest: &Manifest, state: &TempDir) -> Filesys {
    make_fs_opts(fake, manifest, state, false).await
}

async fn make_fs_opts(
    fake: Arc<FakePlatform>,
    manifest: &Manifest,
    state: &TempDir,
    read_only: bool,
) -> Filesys {
    let options: Options = Options::default()
        .with_state_dir(state.path())
        .with_read_only(read_only)
        .with_owner(501, 20);
    Filesys::new_with_tuning(
        fake.clone(),
        fake,
        manifest,
        options,
        PrefetchConfig::default(),
        UploadConfig {
            part_size: 64 * KIB,
            close_poll_interval: Duration::from_millis(10),
            close_timeout: Duration::from_secs(5),
            ..UploadConfig::default()
        },
    )
    .await
    .unwrap()
}

/// Names from a directory listing, '.' and '..' excluded.
fn listing_names(entries: &[(u64, fuser::FileType, String)]) -> Vec<&str> {
    entries
        .iter()
        .map(|(_, _, name)| name.as_str())
        .filter(|n| *n != "." && *n != "..")
        .collect()
}

#[tokio::test]
async fn test_readdir_matches_remote_folder() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![obj("file-A", "a.txt", 10), obj("file-B", "b.txt", 20)],
            subdirs: vec!["sub".to_string()],
        },
    );
    fake.add_folder(
        "project-1111",
        "/sub",
        FolderContents {
            data_objects: vec![obj("file-C", "c.txt", 5)],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    assert!(alpha.ino > 1);
    assert_eq!(alpha.uid, 501);

    let dh: u64 = fs.op_opendir(alpha.ino).await.unwrap();
    let entries = fs.op_readdir(dh, 0).unwrap();
    assert_eq!(listing_names(&entries), vec!["sub", "a.txt", "b.txt"]);

    // Per-entry lookup agrees with the listing (readdir/lookup parity).
    for (ino, _, name) in &entries {
        if name == "." || name == ".." {
            continue;
        }
        let attr = fs.op_lookup(alpha.ino, name).await.unwrap();
        assert_eq!(attr.ino, *ino, "lookup of {} disagrees with readdir", name);
    }
    fs.op_releasedir(dh).unwrap();

    let sub = fs.op_lookup(alpha.ino, "sub").await.unwrap();
    let dh: u64 = fs.op_opendir(sub.ino).await.unwrap();
    let entries = fs.op_readdir(dh, 0).unwrap();
    assert_eq!(listing_names(&entries), vec!["c.txt"]);
    fs.op_releasedir(dh).unwrap();

    // All inodes distinct and above the root.
    let a = fs.op_lookup(alpha.ino, "a.txt").await.unwrap();
    let b = fs.op_lookup(alpha.ino, "b.txt").await.unwrap();
    let c = fs.op_lookup(sub.ino, "c.txt").await.unwrap();
    let mut inodes: Vec<u64> = vec![alpha.ino, sub.ino, a.ino, b.ino, c.ino];
    inodes.sort_unstable();
    inodes.dedup();
    assert_eq!(inodes.len(), 5);
    assert!(inodes.iter().all(|&i| i > 1));
}

#[tokio::test]
async fn test_remote_read_round_trip() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 241) as u8).collect();
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![obj("file-A", "a.bin", content.len() as i64)],
            subdirs: vec![],
        },
    );
    fake.seed_file("file-A", content.clone());

    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    let a = fs.op_lookup(alpha.ino, "a.bin").await.unwrap();
    assert_eq!(a.size, 1000);

    let fh: u64 = fs.op_open(a.ino, libc::O_RDONLY).await.unwrap();
    let head: Vec<u8> = fs.op_read(fh, 0, 100).await.unwrap();
    assert_eq!(head, &content[..100]);
    let tail: Vec<u8> = fs.op_read(fh, 900, 400).await.unwrap();
    assert_eq!(tail, &content[900..]);
    fs.op_release(fh).unwrap();
}

#[tokio::test]
async fn test_create_write_release_reaches_closed() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    let (attr, fh) = fs.op_create(alpha.ino, "hello.txt").await.unwrap();
    assert_eq!(attr.size, 0);

    assert_eq!(fs.op_write(fh, 0, b"hi\n").unwrap(), 3);

    // Random writes to a new file are refused.
    assert!(matches!(
        fs.op_write(fh, 0, b"x"),
        Err(Error::NotSupported(_))
    ));

    // The handle sees its own staged bytes.
    assert_eq!(fs.op_read(fh, 0, 16).await.unwrap(), b"hi\n");

    fs.op_release(fh).unwrap();

    // Within a bounded time the platform reports the file closed and the
    // index carries the final size.
    let mut settled: bool = false;
    for _ in 0..200 {
        let closed: bool = matches!(
            fake.created_state("hello.txt"),
            Some((FileState::Closed, 3))
        );
        if closed && fs.op_getattr(attr.ino).unwrap().size == 3 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(settled, "file never reached closed with the right size");

    // Re-reading goes through the remote path now.
    let rfh: u64 = fs.op_open(attr.ino, libc::O_RDONLY).await.unwrap();
    assert_eq!(fs.op_read(rfh, 0, 16).await.unwrap(), b"hi\n");
    fs.op_release(rfh).unwrap();
}

#[tokio::test]
async fn test_create_on_view_only_project_makes_no_remote_call() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::View);
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    let describes_before: u32 = fake.folder_describes.load(Ordering::SeqCst);

    let err = fs.op_create(alpha.ino, "x.txt").await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    // The refusal happened before any remote traffic.
    assert_eq!(fake.file_news.load(Ordering::SeqCst), 0);
    assert_eq!(fake.folder_describes.load(Ordering::SeqCst), describes_before);
}

#[tokio::test]
async fn test_read_only_mount_refuses_create() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs_opts(fake.clone(), &alpha_manifest(), &state, true).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    assert!(matches!(
        fs.op_create(alpha.ino, "x.txt").await,
        Err(Error::PermissionDenied(_))
    ));
    assert_eq!(fake.file_news.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_duplicate_name_is_exists() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![obj("file-A", "taken.txt", 10)],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    assert!(matches!(
        fs.op_create(alpha.ino, "taken.txt").await,
        Err(Error::Exists)
    ));
}

#[tokio::test]
async fn test_unmount_drains_open_files() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    let payload: Vec<u8> = vec![7u8; 200 * KIB as usize];
    for i in 0..3 {
        let name: String = format!("out{}.dat", i);
        let (_, fh) = fs.op_create(alpha.ino, &name).await.unwrap();
        fs.op_write(fh, 0, &payload).unwrap();
        // No release: unmount must seal these.
    }

    fs.shutdown().await;

    for i in 0..3 {
        let name: String = format!("out{}.dat", i);
        assert_eq!(
            fake.created_state(&name),
            Some((FileState::Closed, 200 * KIB as usize)),
            "file {} did not drain to closed",
            name
        );
    }
}

#[tokio::test]
async fn test_symlink_readlink() {
    let mut fake = FakePlatform::default();
    fake.add_project("project-1111", "alpha", ProjectPermission::Contribute);
    let mut link = obj("file-S", "pointer", 0);
    link.symlink_path = Some("/somewhere/else".to_string());
    fake.add_folder(
        "project-1111",
        "/",
        FolderContents {
            data_objects: vec![link],
            subdirs: vec![],
        },
    );
    let fake = Arc::new(fake);
    let state = TempDir::new().unwrap();
    let fs: Filesys = make_fs(fake.clone(), &alpha_manifest(), &state).await;

    let alpha = fs.op_lookup(1, "alpha").await.unwrap();
    let link_attr = fs.op_lookup(alpha.ino, "pointer").await.unwrap();
    assert_eq!(link_attr.kind, fuser::FileType::Symlink);
    assert_eq!(
        fs.op_readlink(link_attr.ino).unwrap(),
        b"/somewhere/else".to_vec()
    );
}
