//! Per-handle sequential read-ahead with adaptive windows.
//!
//! Each open remote-read handle tracks a sliding window of pre-downloaded
//! byte ranges. Streaming readers (`cat`, `head`, `grep -R`) are detected
//! by watching access offsets; once a reader proves sequential, the next
//! window is fetched in the background and the window doubles on every
//! completed fetch, up to a cap. Random readers get exactly the bytes
//! they asked for and nothing speculative.
//!
//! Memory is bounded globally: when cached chunks exceed the budget, the
//! least-recently-used chunks are evicted across all handles, except for
//! a handle that is in the middle of serving a read.
//!
//! # Thread safety
//!
//! - The handle map and every per-handle state sit behind their own
//!   mutexes, held only for bookkeeping. Fetches run with no lock held.
//! - Workers signal waiting readers through a per-handle `Notify`.
//! - Eviction takes the map lock and then one handle lock at a time, and
//!   is never invoked while a handle lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use dxfuse_common::{
    Error, Result, KIB, NUM_RETRIES_DEFAULT, PREFETCH_MAX_WINDOW, PREFETCH_MEMORY_BUDGET,
    PREFETCH_MIN_WINDOW, PREFETCH_WORKERS,
};
use dxfuse_platform::{retry_with_backoff, DownloadUrl, RangeFetcher};

/// Reads this close to the previous end still count as sequential.
const SEQ_TOLERANCE: u64 = 64 * KIB;

/// Source of fresh download URLs when one expires mid-stream.
#[async_trait]
pub trait UrlSource: Send + Sync {
    async fn download_url(&self, file_id: &str, project_id: &str) -> Result<DownloadUrl>;
}

/// Tuning knobs for the prefetcher.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Initial background window size.
    pub min_window: u64,
    /// Window growth cap.
    pub max_window: u64,
    /// Global byte budget across all handles.
    pub memory_budget: u64,
    /// Background worker count.
    pub workers: usize,
    /// Retry bound for a single ranged GET.
    pub retries: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            min_window: PREFETCH_MIN_WINDOW,
            max_window: PREFETCH_MAX_WINDOW,
            memory_budget: PREFETCH_MEMORY_BUDGET,
            workers: PREFETCH_WORKERS,
            retries: NUM_RETRIES_DEFAULT,
        }
    }
}

/// What the detector currently believes about a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessPattern {
    Probing,
    Sequential,
    Random,
}

struct CachedChunk {
    data: Vec<u8>,
    /// Logical access time, from the global clock.
    stamp: u64,
}

/// Sentinel: no read served yet on this handle.
const NO_ACCESS: u64 = u64::MAX;

struct HandleState {
    handle_id: u64,
    file_id: String,
    proj_id: String,
    file_size: u64,
    url: DownloadUrl,
    /// Disjoint-ish downloaded ranges, keyed by starting offset.
    cache: BTreeMap<u64, CachedChunk>,
    /// Where the next background window starts.
    window_offset: u64,
    /// Size of the next background window.
    window_bytes: u64,
    /// End offset of the last served read, or NO_ACCESS.
    last_access_end: u64,
    pattern: AccessPattern,
    /// Range currently being fetched in the background, if any.
    inflight: Option<(u64, u64)>,
    /// A synchronous read is being served; exempt from eviction.
    reading: bool,
    cancelled: bool,
}

struct HandleEntry {
    state: Mutex<HandleState>,
    notify: Notify,
}

struct FetchTask {
    handle_id: u64,
    offset: u64,
    len: u64,
}

struct PrefetchCore {
    handles: Mutex<HashMap<u64, Arc<HandleEntry>>>,
    /// Bytes currently cached across all handles.
    total_bytes: AtomicU64,
    /// Monotonic logical clock for LRU stamps.
    clock: AtomicU64,
    task_tx: mpsc::UnboundedSender<FetchTask>,
    fetcher: Arc<dyn RangeFetcher>,
    urls: Arc<dyn UrlSource>,
    config: PrefetchConfig,
}

/// Global prefetch state for one mount.
pub struct Prefetcher {
    core: Arc<PrefetchCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Prefetcher {
    /// Build the prefetcher and spawn its worker pool. Must run inside a
    /// tokio runtime.
    pub fn new(
        fetcher: Arc<dyn RangeFetcher>,
        urls: Arc<dyn UrlSource>,
        config: PrefetchConfig,
    ) -> Prefetcher {
        let (task_tx, task_rx) = mpsc::unbounded_channel::<FetchTask>();
        let core = Arc::new(PrefetchCore {
            handles: Mutex::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            task_tx,
            fetcher,
            urls,
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

        Prefetcher {
            core,
            workers: Mutex::new(workers),
        }
    }

    /// Register an open remote-read handle.
    pub fn open(
        &self,
        handle_id: u64,
        file_id: &str,
        proj_id: &str,
        file_size: u64,
        url: DownloadUrl,
    ) {
        let entry = Arc::new(HandleEntry {
            state: Mutex::new(HandleState {
                handle_id,
                file_id: file_id.to_string(),
                proj_id: proj_id.to_string(),
                file_size,
                url,
                cache: BTreeMap::new(),
                window_offset: 0,
                window_bytes: self.core.config.min_window,
                last_access_end: NO_ACCESS,
                pattern: AccessPattern::Probing,
                inflight: None,
                reading: false,
                cancelled: false,
            }),
            notify: Notify::new(),
        });
        self.core.handles.lock().unwrap().insert(handle_id, entry);
    }

    /// Release a handle: cancel its in-flight fetch cooperatively and
    /// drop its cached chunks.
    pub fn close(&self, handle_id: u64) {
        let entry = self.core.handles.lock().unwrap().remove(&handle_id);
        if let Some(entry) = entry {
            let mut st = entry.state.lock().unwrap();
            st.cancelled = true;
            let cached: u64 = st.cache.values().map(|c| c.data.len() as u64).sum();
            st.cache.clear();
            self.core.total_bytes.fetch_sub(cached, Ordering::SeqCst);
            drop(st);
            entry.notify.notify_waiters();
        }
    }

    /// Cancel everything; used on unmount.
    pub fn shutdown(&self) {
        {
            let handles = self.core.handles.lock().unwrap();
            for entry in handles.values() {
                entry.state.lock().unwrap().cancelled = true;
                entry.notify.notify_waiters();
            }
        }
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
    }

    /// Serve a read: from cache when possible, otherwise by fetching the
    /// missing span synchronously. Reads past EOF return empty.
    pub async fn read(&self, handle_id: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        let entry: Arc<HandleEntry> = self
            .core
            .handles
            .lock()
            .unwrap()
            .get(&handle_id)
            .cloned()
            .ok_or(Error::NotFound)?;

        enum Step {
            Serve(Vec<u8>),
            Wait,
            Fetch(u64, u64),
        }

        loop {
            // Register for wakeups before checking state, so a fetch
            // completing in between cannot be missed.
            let notified = entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step: Step = {
                let mut st = entry.state.lock().unwrap();
                if st.cancelled {
                    return Err(Error::IO("read on a released handle".to_string()));
                }
                let end: u64 = (offset + len as u64).min(st.file_size);
                if offset >= end {
                    Step::Serve(Vec::new())
                } else if let Some(data) = self.core.serve_from_cache(&mut st, offset, end) {
                    self.core.note_access(&mut st, offset, end);
                    Step::Serve(data)
                } else {
                    let (miss_start, miss_end) = missing_span(&st.cache, offset, end);
                    let overlaps_inflight: bool = st
                        .inflight
                        .map_or(false, |(i0, i1)| i0 < miss_end && miss_start < i1);
                    if overlaps_inflight {
                        Step::Wait
                    } else {
                        st.reading = true;
                        Step::Fetch(miss_start, miss_end)
                    }
                }
            };

            match step {
                Step::Serve(data) => {
                    self.core.evict();
                    return Ok(data);
                }
                Step::Wait => {
                    notified.await;
                }
                Step::Fetch(miss_start, miss_end) => {
                    let fetched: Result<Vec<u8>> = self
                        .core
                        .fetch_with_refresh(&entry, miss_start, miss_end - miss_start)
                        .await;

                    let served: Result<Vec<u8>> = {
                        let mut st = entry.state.lock().unwrap();
                        st.reading = false;
                        match fetched {
                            Err(e) => Err(e),
                            Ok(data) => {
                                self.core.insert_chunk(&mut st, miss_start, data);
                                // A synchronous fetch advances the window
                                // just like a completed background one.
                                if miss_end > st.window_offset {
                                    st.window_offset = miss_end;
                                }
                                st.window_bytes =
                                    (st.window_bytes * 2).min(self.core.config.max_window);

                                let end: u64 = (offset + len as u64).min(st.file_size);
                                match self.core.serve_from_cache(&mut st, offset, end) {
                                    Some(data) => {
                                        self.core.note_access(&mut st, offset, end);
                                        Ok(data)
                                    }
                                    None => Err(Error::IO(
                                        "range fetch did not cover the read".to_string(),
                                    )),
                                }
                            }
                        }
                    };
                    self.core.evict();
                    return served;
                }
            }
        }
    }

    #[cfg(test)]
    fn cached_bytes(&self) -> u64 {
        self.core.total_bytes.load(Ordering::SeqCst)
    }
}

impl PrefetchCore {
    /// Assemble `[offset, end)` from cached chunks, or None on any gap.
    /// Touches the stamps of every chunk used.
    fn serve_from_cache(&self, st: &mut HandleState, offset: u64, end: u64) -> Option<Vec<u8>> {
        if offset >= end {
            return Some(Vec::new());
        }
        // Dry run first: verify coverage without copying.
        let mut cursor: u64 = offset;
        for (&c_off, chunk) in st.cache.range(..end) {
            let c_end: u64 = c_off + chunk.data.len() as u64;
            if c_end <= cursor {
                continue;
            }
            if c_off > cursor {
                return None;
            }
            cursor = c_end.min(end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            return None;
        }

        let stamp: u64 = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut out: Vec<u8> = Vec::with_capacity((end - offset) as usize);
        let mut cursor: u64 = offset;
        for (&c_off, chunk) in st.cache.range_mut(..end) {
            let c_end: u64 = c_off + chunk.data.len() as u64;
            if c_end <= cursor {
                continue;
            }
            chunk.stamp = stamp;
            let from: usize = (cursor - c_off) as usize;
            let to: usize = (c_end.min(end) - c_off) as usize;
            out.extend_from_slice(&chunk.data[from..to]);
            cursor = c_end.min(end);
            if cursor >= end {
                break;
            }
        }
        Some(out)
    }

    /// Update the detector after serving `[offset, end)`, and keep the
    /// background pipeline primed while the reader stays sequential.
    fn note_access(&self, st: &mut HandleState, offset: u64, end: u64) {
        if st.last_access_end == NO_ACCESS {
            // First read proves nothing yet.
            st.last_access_end = end;
            return;
        }

        let low: u64 = st.last_access_end.saturating_sub(SEQ_TOLERANCE);
        let high: u64 = st.last_access_end.saturating_add(SEQ_TOLERANCE);
        st.pattern = if offset >= low && offset <= high {
            AccessPattern::Sequential
        } else {
            AccessPattern::Random
        };
        st.last_access_end = end;

        if st.pattern == AccessPattern::Sequential
            && st.inflight.is_none()
            && !st.cancelled
            && st.window_offset < st.file_size
        {
            let start: u64 = st.window_offset.max(end);
            if start >= st.file_size {
                return;
            }
            let len: u64 = st.window_bytes.min(st.file_size - start);
            st.inflight = Some((start, start + len));
            // A send failure just means we are shutting down.
            let _ = self.task_tx.send(FetchTask {
                handle_id: st.handle_id,
                offset: start,
                len,
            });
        }
    }

    fn insert_chunk(&self, st: &mut HandleState, offset: u64, data: Vec<u8>) {
        let stamp: u64 = self.clock.fetch_add(1, Ordering::SeqCst);
        self.total_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        st.cache.insert(offset, CachedChunk { data, stamp });
    }

    /// Drop least-recently-used chunks until the budget holds. Handles
    /// mid-read keep their chunks.
    fn evict(&self) {
        while self.total_bytes.load(Ordering::SeqCst) > self.config.memory_budget {
            let handles = self.handles.lock().unwrap();
            let mut victim: Option<(u64, u64, u64)> = None;
            for (&hid, entry) in handles.iter() {
                let st = entry.state.lock().unwrap();
                if st.reading {
                    continue;
                }
                for (&off, chunk) in &st.cache {
                    let better: bool = victim.map_or(true, |(_, _, stamp)| chunk.stamp < stamp);
                    if better {
                        victim = Some((hid, off, chunk.stamp));
                    }
                }
            }
            let (hid, off, _) = match victim {
                Some(v) => v,
                None => break,
            };
            if let Some(entry) = handles.get(&hid) {
                let mut st = entry.state.lock().unwrap();
                if let Some(chunk) = st.cache.remove(&off) {
                    self.total_bytes
                        .fetch_sub(chunk.data.len() as u64, Ordering::SeqCst);
                }
            }
        }
    }

    /// Ranged GET with bounded retries; an expired URL is refreshed
    /// through the URL source and the fetch retried, also bounded.
    async fn fetch_with_refresh(
        &self,
        entry: &Arc<HandleEntry>,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let (file_id, proj_id) = {
            let st = entry.state.lock().unwrap();
            (st.file_id.clone(), st.proj_id.clone())
        };

        let mut refreshes: u32 = 0;
        loop {
            let url: DownloadUrl = entry.state.lock().unwrap().url.clone();
            let attempt = retry_with_backoff("ranged download", self.config.retries, |_| {
                self.fetcher.fetch_range(&url, offset, len)
            })
            .await;

            match attempt {
                Ok(data) => return Ok(data),
                Err(Error::Auth(msg)) if refreshes < self.config.retries => {
                    refreshes += 1;
                    tracing::info!(
                        "download URL for {} expired ({}); refreshing",
                        file_id,
                        msg
                    );
                    let fresh: DownloadUrl = self.urls.download_url(&file_id, &proj_id).await?;
                    entry.state.lock().unwrap().url = fresh;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn worker_loop(
    core: Arc<PrefetchCore>,
    task_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FetchTask>>>,
) {
    loop {
        let task: FetchTask = {
            let mut rx = task_rx.lock().await;
            match rx.recv().await {
                Some(t) => t,
                None => return,
            }
        };

        let entry: Option<Arc<HandleEntry>> =
            core.handles.lock().unwrap().get(&task.handle_id).cloned();
        let entry: Arc<HandleEntry> = match entry {
            Some(e) => e,
            // Handle released while the task sat in the queue.
            None => continue,
        };
        if entry.state.lock().unwrap().cancelled {
            continue;
        }

        let result: Result<Vec<u8>> = core
            .fetch_with_refresh(&entry, task.offset, task.len)
            .await;

        {
            let mut st = entry.state.lock().unwrap();
            st.inflight = None;
            match result {
                Ok(data) if !st.cancelled => {
                    core.insert_chunk(&mut st, task.offset, data);
                    let fetched_end: u64 = task.offset + task.len;
                    if fetched_end > st.window_offset {
                        st.window_offset = fetched_end;
                    }
                    st.window_bytes = (st.window_bytes * 2).min(core.config.max_window);
                }
                Ok(_) => {
                    // Cancelled mid-flight; discard the bytes.
                }
                Err(e) => {
                    // Speculative only: the reader that needs this range
                    // will fetch it synchronously and see the error there.
                    tracing::warn!(
                        "background fetch [{}, {}) failed: {}",
                        task.offset,
                        task.offset + task.len,
                        e
                    );
                }
            }
        }
        entry.notify.notify_waiters();
        core.evict();
    }
}

/// The smallest `[start, stop)` span inside `[offset, end)` that is not
/// covered by the cache. Both edges are trimmed by existing coverage.
fn missing_span(cache: &BTreeMap<u64, CachedChunk>, offset: u64, end: u64) -> (u64, u64) {
    let mut start: u64 = offset;
    for (&c_off, chunk) in cache.range(..end) {
        let c_end: u64 = c_off + chunk.data.len() as u64;
        if c_end <= start {
            continue;
        }
        if c_off > start {
            break;
        }
        start = c_end;
        if start >= end {
            return (end, end);
        }
    }

    let mut stop: u64 = end;
    for (&c_off, chunk) in cache.range(..end).rev() {
        let c_end: u64 = c_off + chunk.data.len() as u64;
        if c_end < stop {
            break;
        }
        if c_off < stop {
            stop = c_off;
        }
        if stop <= start {
            break;
        }
    }
    (start, stop.max(start))
}
