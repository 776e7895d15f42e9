//! Background upload of newly created files.
//!
//! Writes land in a local staging file first. Each time the unsliced
//! tail crosses the part threshold, a part is cut and queued for upload
//! with a monotonic 1-based index. Parts enter the queue in index order
//! and may transit concurrently; the remote close waits for all of them,
//! so the platform observes the file in order.
//!
//! Releasing the writable handle seals the file: the remaining tail goes
//! out as the final part, the remote close is issued, and the subsystem
//! polls until the platform reports the file closed, at which point the
//! metadata index records the final size and the staging file is
//! deleted. A part that keeps failing marks the whole file failed; the
//! failure surfaces on the next operation touching the file and is
//! always logged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use dxfuse_common::{Error, Result, NUM_RETRIES_DEFAULT, UPLOAD_PART_SIZE, UPLOAD_WORKERS};
use dxfuse_platform::{retry_with_backoff, FileState};

/// Remote side of the upload pipeline. Faked in tests.
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    /// Upload one part. Indices start at 1.
    async fn upload_part(&self, file_id: &str, index: u32, data: Vec<u8>) -> Result<()>;

    /// Seal the file remotely.
    async fn close_file(&self, file_id: &str) -> Result<()>;

    /// Current remote state and size, for the close poll.
    async fn file_status(&self, file_id: &str) -> Result<(FileState, i64)>;
}

/// The slice of the metadata index the uploader needs.
pub trait IndexUpdater: Send + Sync {
    /// Record the final size/mtime of a closed file and drop its staging
    /// reference.
    fn finalize_file(&self, inode: i64, size: i64, mtime: i64) -> Result<()>;
}

/// Lifecycle of one uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Accepting writes.
    Open,
    /// Released; flushing the tail and waiting for parts.
    Sealing,
    /// Remote close issued; waiting for the platform.
    Closing,
    Closed,
    Failed,
}

/// Tuning knobs for the upload subsystem.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Tail size that triggers slicing a part.
    pub part_size: u64,
    pub workers: usize,
    /// Retry bound per part.
    pub retries: u32,
    /// Cadence of the close poll.
    pub close_poll_interval: Duration,
    /// Give up waiting for the platform to close a file after this.
    pub close_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: UPLOAD_PART_SIZE,
            workers: UPLOAD_WORKERS,
            retries: NUM_RETRIES_DEFAULT,
            close_poll_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(300),
        }
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct FileUploadState {
    inode: i64,
    file_id: String,
    staging_path: PathBuf,
    /// Total bytes appended so far.
    bytes_written: u64,
    /// Bytes already sliced into parts.
    sliced_offset: u64,
    /// Next part index to hand out; parts are 1-based.
    next_part_index: u32,
    /// Parts queued or in flight.
    parts_inflight: u32,
    state: UploadState,
    error: Option<Error>,
}

struct FileEntry {
    state: Mutex<FileUploadState>,
    notify: Notify,
}

struct PartTask {
    inode: i64,
    index: u32,
    offset: u64,
    len: u64,
}

struct UploadCore {
    files: Mutex<HashMap<i64, Arc<FileEntry>>>,
    task_tx: mpsc::UnboundedSender<PartTask>,
    uploader: Arc<dyn RemoteUploader>,
    index: Arc<dyn IndexUpdater>,
    config: UploadConfig,
}

/// Global upload state for one mount.
pub struct Uploader {
    core: Arc<UploadCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Uploader {
    /// Build the uploader and spawn its worker pool. Must run inside a
    /// tokio runtime.
    pub fn new(
        uploader: Arc<dyn RemoteUploader>,
        index: Arc<dyn IndexUpdater>,
        config: UploadConfig,
    ) -> Uploader {
        let (task_tx, task_rx) = mpsc::unbounded_channel::<PartTask>();
        let core = Arc::new(UploadCore {
            files: Mutex::new(HashMap::new()),
            task_tx,
            uploader,
            index,
            config: config.clone(),
        });

        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|_| {
                let core = core.clone();
                let task_rx = task_rx.clone();
                tokio::spawn(worker_loop(core, task_rx))
            })
            .collect();

        Uploader {
            core,
            workers: Mutex::new(workers),
        }
    }

    /// Track a newly created file. Called right after the remote
    /// file-new succeeds.
    pub fn register(&self, inode: i64, file_id: &str, staging_path: &Path) {
        let entry = Arc::new(FileEntry {
            state: Mutex::new(FileUploadState {
                inode,
                file_id: file_id.to_string(),
                staging_path: staging_path.to_path_buf(),
                bytes_written: 0,
                sliced_offset: 0,
                next_part_index: 1,
                parts_inflight: 0,
                state: UploadState::Open,
                error: None,
            }),
            notify: Notify::new(),
        });
        self.core.files.lock().unwrap().insert(inode, entry);
    }

    /// Note `len` bytes appended to the staging file. Slices and queues
    /// as many full parts as the new tail covers.
    pub fn append(&self, inode: i64, len: u64) -> Result<()> {
        let entry: Arc<FileEntry> = self.entry(inode)?;
        let mut st = entry.state.lock().unwrap();
        if st.state != UploadState::Open {
            return Err(st
                .error
                .clone()
                .unwrap_or_else(|| Error::IO("write to a sealed file".to_string())));
        }
        st.bytes_written += len;
        while st.bytes_written - st.sliced_offset >= self.core.config.part_size {
            let task = PartTask {
                inode,
                index: st.next_part_index,
                offset: st.sliced_offset,
                len: self.core.config.part_size,
            };
            st.sliced_offset += self.core.config.part_size;
            st.next_part_index += 1;
            st.parts_inflight += 1;
            let _ = self.core.task_tx.send(task);
        }
        Ok(())
    }

    /// Bytes appended so far, if the file is still tracked.
    pub fn current_size(&self, inode: i64) -> Option<u64> {
        let files = self.core.files.lock().unwrap();
        files
            .get(&inode)
            .map(|e| e.state.lock().unwrap().bytes_written)
    }

    /// Upload state, if the file is still tracked.
    pub fn state_of(&self, inode: i64) -> Option<UploadState> {
        let files = self.core.files.lock().unwrap();
        files.get(&inode).map(|e| e.state.lock().unwrap().state)
    }

    /// A recorded failure for this file, surfaced on the next operation.
    pub fn error_of(&self, inode: i64) -> Option<Error> {
        let files = self.core.files.lock().unwrap();
        files
            .get(&inode)
            .and_then(|e| e.state.lock().unwrap().error.clone())
    }

    /// Seal the file in the background; the caller's release returns
    /// immediately.
    pub fn schedule_finalize(&self, inode: i64) {
        let core = self.core.clone();
        tokio::spawn(async move {
            finalize(&core, inode).await;
        });
    }

    /// Seal the file and wait for it to reach `Closed` (or fail). Used
    /// by tests and the drain path.
    pub async fn finalize_and_wait(&self, inode: i64) {
        finalize(&self.core, inode).await;
    }

    /// Unmount path: seal every open file, then wait for all files to
    /// reach a terminal state, up to `timeout`. Stragglers become
    /// `Failed` and are reported in the log.
    pub async fn drain(&self, timeout: Duration) {
        let open_inodes: Vec<i64> = {
            let files = self.core.files.lock().unwrap();
            files
                .iter()
                .filter(|(_, e)| e.state.lock().unwrap().state == UploadState::Open)
                .map(|(&inode, _)| inode)
                .collect()
        };
        for inode in open_inodes {
            self.schedule_finalize(inode);
        }

        let deadline: Instant = Instant::now() + timeout;
        loop {
            let pending: Vec<Arc<FileEntry>> = {
                let files = self.core.files.lock().unwrap();
                files
                    .values()
                    .filter(|e| {
                        !matches!(
                            e.state.lock().unwrap().state,
                            UploadState::Closed | UploadState::Failed
                        )
                    })
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                for entry in pending {
                    let mut st = entry.state.lock().unwrap();
                    tracing::error!(
                        "unmount: file {} ({}) still {:?} after the drain timeout",
                        st.file_id,
                        st.staging_path.display(),
                        st.state
                    );
                    st.state = UploadState::Failed;
                    st.error = Some(Error::Timeout("upload drain timed out".to_string()));
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop the worker pool. Call after `drain`.
    pub fn shutdown(&self) {
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
    }

    fn entry(&self, inode: i64) -> Result<Arc<FileEntry>> {
        self.core
            .files
            .lock()
            .unwrap()
            .get(&inode)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

/// Seal one file: flush the tail, wait for parts, close remotely, poll
/// for the closed state, then record the final size in the index.
async fn finalize(core: &Arc<UploadCore>, inode: i64) {
    let entry: Arc<FileEntry> = match core.files.lock().unwrap().get(&inode).cloned() {
        Some(e) => e,
        None => return,
    };

    let file_id: String = {
        let mut st = entry.state.lock().unwrap();
        if st.state != UploadState::Open {
            return;
        }
        st.state = UploadState::Sealing;

        // The remaining tail, possibly the only part of a small file.
        if st.bytes_written > st.sliced_offset {
            let task = PartTask {
                inode,
                index: st.next_part_index,
                offset: st.sliced_offset,
                len: st.bytes_written - st.sliced_offset,
            };
            st.sliced_offset = st.bytes_written;
            st.next_part_index += 1;
            st.parts_inflight += 1;
            let _ = core.task_tx.send(task);
        }
        st.file_id.clone()
    };

    // Wait for every queued part to land or fail. The wakeup interest
    // is registered before the state check so a part completing in
    // between cannot be missed.
    loop {
        let notified = entry.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let st = entry.state.lock().unwrap();
            if st.state == UploadState::Failed {
                tracing::error!("file {} failed during part upload; not closing", file_id);
                return;
            }
            if st.parts_inflight == 0 {
                break;
            }
        }
        notified.await;
    }

    if let Err(e) = core.uploader.close_file(&file_id).await {
        fail_file(&entry, &file_id, e);
        return;
    }
    entry.state.lock().unwrap().state = UploadState::Closing;

    // The platform finishes the close asynchronously; poll until it
    // reports the file closed.
    let deadline: Instant = Instant::now() + core.config.close_timeout;
    let final_size: i64 = loop {
        match core.uploader.file_status(&file_id).await {
            Ok((FileState::Closed, size)) => break size,
            Ok(_) => {}
            Err(e) => {
                fail_file(&entry, &file_id, e);
                return;
            }
        }
        if Instant::now() >= deadline {
            fail_file(
                &entry,
                &file_id,
                Error::Timeout("file did not close in time".to_string()),
            );
            return;
        }
        tokio::time::sleep(core.config.close_poll_interval).await;
    };

    if let Err(e) = core.index.finalize_file(inode, final_size, now_seconds()) {
        fail_file(&entry, &file_id, e);
        return;
    }

    let staging: PathBuf = {
        let mut st = entry.state.lock().unwrap();
        st.state = UploadState::Closed;
        st.staging_path.clone()
    };
    entry.notify.notify_waiters();
    if let Err(e) = std::fs::remove_file(&staging) {
        tracing::warn!("could not remove staging file {}: {}", staging.display(), e);
    }

    core.files.lock().unwrap().remove(&inode);
    tracing::info!("file {} closed, {} bytes", file_id, final_size);
}

fn fail_file(entry: &Arc<FileEntry>, file_id: &str, err: Error) {
    tracing::error!("upload of {} failed: {}", file_id, err);
    let mut st = entry.state.lock().unwrap();
    st.state = UploadState::Failed;
    st.error = Some(err);
    drop(st);
    entry.notify.notify_waiters();
}

/// Read one part's bytes out of the staging file.
async fn read_part(staging_path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(staging_path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut data: Vec<u8> = vec![0; len as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

async fn worker_loop(
    core: Arc<UploadCore>,
    task_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PartTask>>>,
) {
    loop {
        let task: PartTask = {
            let mut rx = task_rx.lock().await;
            match rx.recv().await {
                Some(t) => t,
                None => return,
            }
        };

        let entry: Option<Arc<FileEntry>> =
            core.files.lock().unwrap().get(&task.inode).cloned();
        let entry: Arc<FileEntry> = match entry {
            Some(e) => e,
            None => continue,
        };

        let (file_id, staging_path, already_failed) = {
            let st = entry.state.lock().unwrap();
            (
                st.file_id.clone(),
                st.staging_path.clone(),
                st.state == UploadState::Failed,
            )
        };

        let result: Result<()> = if already_failed {
            // One failed part fails the file; skip the rest of its queue.
            Ok(())
        } else {
            match read_part(&staging_path, task.offset, task.len).await {
                Err(e) => Err(e),
                Ok(data) => {
                    let op_name: String = format!("{} part {}", file_id, task.index);
                    retry_with_backoff(&op_name, core.config.retries, |_| {
                        core.uploader
                            .upload_part(&file_id, task.index, data.clone())
                    })
                    .await
                }
            }
        };

        {
            let mut st = entry.state.lock().unwrap();
            st.parts_inflight -= 1;
            if let Err(e) = result {
                tracing::error!("part {} of {} failed: {}", task.index, file_id, e);
                st.state = UploadState::Failed;
                st.error = Some(e);
            }
        }
        entry.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use dxfuse_common::KIB;
    use tempfile::TempDir;

    use super::*;

    /// Collects parts in memory and reports files closed as soon as the
    /// close call lands.
    #[derive(Default)]
    struct FakeRemote {
        parts: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
        closed: Mutex<Vec<String>>,
        fail_parts: AtomicBool,
    }

    impl FakeRemote {
        fn assembled(&self, file_id: &str) -> Vec<u8> {
            let parts = self.parts.lock().unwrap();
            let mut out: Vec<u8> = Vec::new();
            if let Some(m) = parts.get(file_id) {
                for (_, p) in m.iter() {
                    out.extend_from_slice(p);
                }
            }
            out
        }
    }

    #[async_trait]
    impl RemoteUploader for FakeRemote {
        async fn upload_part(&self, file_id: &str, index: u32, data: Vec<u8>) -> Result<()> {
            if self.fail_parts.load(Ordering::SeqCst) {
                return Err(Error::IO("backing store rejected the part".to_string()));
            }
            self.parts
                .lock()
                .unwrap()
                .entry(file_id.to_string())
                .or_default()
                .insert(index, data);
            Ok(())
        }

        async fn close_file(&self, file_id: &str) -> Result<()> {
            self.closed.lock().unwrap().push(file_id.to_string());
            Ok(())
        }

        async fn file_status(&self, file_id: &str) -> Result<(FileState, i64)> {
            if self.closed.lock().unwrap().iter().any(|f| f == file_id) {
                let size: i64 = self.assembled(file_id).len() as i64;
                Ok((FileState::Closed, size))
            } else {
                Ok((FileState::Open, 0))
            }
        }
    }

    #[derive(Default)]
    struct FakeIndex {
        finalized: Mutex<HashMap<i64, (i64, i64)>>,
    }

    impl IndexUpdater for FakeIndex {
        fn finalize_file(&self, inode: i64, size: i64, mtime: i64) -> Result<()> {
            self.finalized.lock().unwrap().insert(inode, (size, mtime));
            Ok(())
        }
    }

    fn setup(
        config: UploadConfig,
    ) -> (Uploader, Arc<FakeRemote>, Arc<FakeIndex>, TempDir) {
        let remote = Arc::new(FakeRemote::default());
        let index = Arc::new(FakeIndex::default());
        let uploader = Uploader::new(remote.clone(), index.clone(), config);
        (uploader, remote, index, TempDir::new().unwrap())
    }

    fn stage(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path: PathBuf = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_small_file_uploads_one_part_and_closes() {
        let (up, remote, index, dir) = setup(UploadConfig::default());
        let data: &[u8] = b"hi\n";
        let staging: PathBuf = stage(&dir, "1_aaaa", data);

        up.register(7, "file-0007", &staging);
        up.append(7, data.len() as u64).unwrap();
        assert_eq!(up.current_size(7), Some(3));

        up.finalize_and_wait(7).await;

        assert_eq!(remote.assembled("file-0007"), data);
        assert_eq!(remote.closed.lock().unwrap().as_slice(), &["file-0007"]);
        assert_eq!(index.finalized.lock().unwrap()[&7].0, 3);
        // Tracking ends once the file is closed; the staging copy is gone.
        assert!(up.state_of(7).is_none());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_parts_sliced_at_threshold_in_index_order() {
        let config = UploadConfig {
            part_size: 64 * KIB,
            ..UploadConfig::default()
        };
        let (up, remote, _index, dir) = setup(config);

        let data: Vec<u8> = (0..200 * KIB).map(|i| (i % 249) as u8).collect();
        let staging: PathBuf = stage(&dir, "2_bbbb", &data);
        up.register(8, "file-0008", &staging);

        // Four appends of 50 KiB; full parts slice off as the tail
        // crosses 64 KiB.
        for _ in 0..4 {
            up.append(8, 50 * KIB).unwrap();
        }
        up.finalize_and_wait(8).await;

        let parts = remote.parts.lock().unwrap();
        let file_parts: &BTreeMap<u32, Vec<u8>> = &parts[&"file-0008".to_string()];
        // 200 KiB at a 64 KiB threshold: three full parts and the tail.
        let indices: Vec<u32> = file_parts.keys().copied().collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert_eq!(file_parts[&1].len(), (64 * KIB) as usize);
        assert_eq!(file_parts[&4].len(), (8 * KIB) as usize);
        drop(parts);
        assert_eq!(remote.assembled("file-0008"), data);
    }

    #[tokio::test]
    async fn test_empty_file_closes_with_no_parts() {
        let (up, remote, index, dir) = setup(UploadConfig::default());
        let staging: PathBuf = stage(&dir, "3_cccc", b"");

        up.register(9, "file-0009", &staging);
        up.finalize_and_wait(9).await;

        assert!(remote.parts.lock().unwrap().get("file-0009").is_none());
        assert_eq!(remote.closed.lock().unwrap().as_slice(), &["file-0009"]);
        assert_eq!(index.finalized.lock().unwrap()[&9].0, 0);
    }

    #[tokio::test]
    async fn test_failed_part_marks_file_failed() {
        let (up, remote, index, dir) = setup(UploadConfig {
            retries: 1,
            ..UploadConfig::default()
        });
        remote.fail_parts.store(true, Ordering::SeqCst);

        let staging: PathBuf = stage(&dir, "4_dddd", b"doomed bytes");
        up.register(10, "file-0010", &staging);
        up.append(10, 12).unwrap();
        up.finalize_and_wait(10).await;

        assert_eq!(up.state_of(10), Some(UploadState::Failed));
        assert!(up.error_of(10).is_some());
        // The failure surfaces on the next write too.
        assert!(up.append(10, 1).is_err());
        assert!(remote.closed.lock().unwrap().is_empty());
        assert!(index.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_seals_all_open_files() {
        let (up, remote, index, dir) = setup(UploadConfig::default());

        for i in 0..3i64 {
            let data: Vec<u8> = vec![i as u8; 1024];
            let staging: PathBuf = stage(&dir, &format!("{}_eeee", i), &data);
            up.register(100 + i, &format!("file-010{}", i), &staging);
            up.append(100 + i, 1024).unwrap();
        }

        up.drain(Duration::from_secs(10)).await;

        assert_eq!(remote.closed.lock().unwrap().len(), 3);
        let finalized = index.finalized.lock().unwrap();
        for i in 0..3i64 {
            assert_eq!(finalized[&(100 + i)].0, 1024);
        }
    }
}
