//! Memory-resident file cache
//!
//! Files are loaded in the background by [`ReadJobPool`] workers and
//! published into a map keyed by normalized filename. Workers never touch the
//! map: each finished load is sent over a channel to a single committer
//! thread, which publishes it under the map lock.
//!
//! A slot is either `Pending` (one job in flight, plus the batches waiting
//! on it) or `Ready` (a [`CachedFile`] and its reference count). Failed or
//! empty loads are published as [`CachedContent::Missing`] so later lookups
//! fail without touching the disk. Every batch holds one reference per file;
//! the slot is removed when the last reference is released.
//!
//! Writing a file [`invalidate`](MemoryFileCache::invalidate)s its slot. The
//! slot turns `Stale`: batches keep their references, lookups miss, and the
//! next prefetch of the name loads it again.

use crate::core::error::{FsError, Result};
use crate::core::jobs::{JobTicket, ReadJobPool};
use crate::core::symbol::normalize_key;
use ahash::{AHashMap, AHashSet};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Reads a whole file for the cache
pub type Loader = Arc<dyn Fn(&str) -> Result<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum CachedContent {
    Loaded(Arc<[u8]>),
    /// The load failed or produced nothing
    Missing,
}

/// Published cache entry; immutable once in the map
#[derive(Debug)]
pub struct CachedFile {
    name: String,
    content: CachedContent,
}

impl CachedFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &CachedContent {
        &self.content
    }

    pub fn data(&self) -> Option<&Arc<[u8]>> {
        match &self.content {
            CachedContent::Loaded(data) => Some(data),
            CachedContent::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self.content, CachedContent::Missing)
    }

    pub fn len(&self) -> usize {
        self.data().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub jobs_issued: u64,
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// Pending-file counter shared by a batch and the slots it waits on
#[derive(Debug, Default)]
struct BatchState {
    pending: Mutex<usize>,
    ready: Condvar,
}

impl BatchState {
    fn complete_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.ready.notify_all();
        }
    }
}

enum Slot {
    Pending {
        job: u64,
        ticket: Arc<JobTicket>,
        waiters: Vec<Arc<BatchState>>,
        /// References carried over from a stale slot
        held: usize,
    },
    Ready {
        file: Arc<CachedFile>,
        refs: usize,
    },
    Stale {
        refs: usize,
    },
}

struct Completion {
    key: String,
    name: String,
    job: u64,
    result: Result<Vec<u8>>,
}

#[derive(Default)]
struct CacheInner {
    map: Mutex<AHashMap<String, Slot>>,
    next_job: AtomicU64,
    jobs_issued: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheInner {
    fn commit(&self, completion: Completion) {
        let Completion {
            key,
            name,
            job,
            result,
        } = completion;

        let mut map = self.map.lock();
        let current = matches!(map.get(&key), Some(Slot::Pending { job: j, .. }) if *j == job);
        if !current {
            // Cancelled, or another writer published first
            trace!("Discarding late load of {}", name);
            return;
        }

        let content = match result {
            Ok(bytes) if !bytes.is_empty() => CachedContent::Loaded(Arc::from(bytes)),
            Ok(_) => CachedContent::Missing,
            Err(e) => {
                debug!("Prefetch of {} failed: {}", name, e);
                CachedContent::Missing
            }
        };
        let (waiters, held) = match map.remove(&key) {
            Some(Slot::Pending { waiters, held, .. }) => (waiters, held),
            _ => (Vec::new(), 0),
        };
        let refs = held + waiters.len();
        if refs > 0 {
            map.insert(
                key,
                Slot::Ready {
                    file: Arc::new(CachedFile { name, content }),
                    refs,
                },
            );
        }
        drop(map);

        for waiter in waiters {
            waiter.complete_one();
        }
    }

    fn release_key(&self, key: &str) -> bool {
        let mut map = self.map.lock();
        let remove = match map.get_mut(key) {
            Some(Slot::Ready { refs, .. }) | Some(Slot::Stale { refs }) => {
                *refs = refs.saturating_sub(1);
                *refs == 0
            }
            Some(Slot::Pending { held, .. }) => {
                *held = held.saturating_sub(1);
                false
            }
            None => false,
        };
        if remove {
            map.remove(key);
        }
        remove
    }

    fn release_batch(&self, keys: &[String], state: &Arc<BatchState>) {
        let mut cancel = Vec::new();
        {
            let mut map = self.map.lock();
            for key in keys {
                let remove = match map.get_mut(key) {
                    Some(Slot::Ready { refs, .. }) | Some(Slot::Stale { refs }) => {
                        *refs = refs.saturating_sub(1);
                        *refs == 0
                    }
                    Some(Slot::Pending {
                        ticket,
                        waiters,
                        held,
                        ..
                    }) => {
                        let before = waiters.len();
                        waiters.retain(|w| !Arc::ptr_eq(w, state));
                        if waiters.len() == before {
                            // This batch's reference predates the reload
                            *held = held.saturating_sub(1);
                        }
                        if waiters.is_empty() && *held == 0 {
                            cancel.push(Arc::clone(ticket));
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                if remove {
                    map.remove(key);
                }
            }
        }

        // Outside the lock: a running loader may itself probe the cache
        for ticket in cancel {
            if ticket.cancel() {
                trace!("Cancelled prefetch job {}", ticket.id());
            }
        }
    }
}

/// Process-wide cache of fully buffered files
pub struct MemoryFileCache {
    inner: Arc<CacheInner>,
    pool: ReadJobPool,
    completions: Mutex<Option<Sender<Completion>>>,
    committer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryFileCache {
    pub fn new(worker_threads: usize) -> Result<Self> {
        let inner = Arc::new(CacheInner::default());
        let pool = ReadJobPool::new(worker_threads)?;
        let (sender, receiver) = unbounded::<Completion>();

        let committer_inner = Arc::clone(&inner);
        let committer = thread::Builder::new()
            .name("pakfs-cache-commit".to_string())
            .spawn(move || commit_loop(committer_inner, receiver))?;

        Ok(MemoryFileCache {
            inner,
            pool,
            completions: Mutex::new(Some(sender)),
            committer: Mutex::new(Some(committer)),
        })
    }

    /// Start background loads for every name not already cached or in flight
    pub fn prefetch<I, S>(&self, names: I, loader: Loader) -> Result<PrefetchBatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sender = self
            .completions
            .lock()
            .clone()
            .ok_or_else(|| {
                FsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "cache is shut down",
                ))
            })?;

        let state = Arc::new(BatchState::default());
        let mut keys = Vec::new();
        let mut seen = AHashSet::new();
        let mut pending = 0usize;

        let mut map = self.inner.map.lock();
        for name in names {
            let name = name.as_ref();
            let key = normalize_key(name);
            if !seen.insert(key.clone()) {
                continue;
            }

            let reload = match map.get_mut(&key) {
                Some(Slot::Ready { refs, .. }) => {
                    *refs += 1;
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(Slot::Pending { waiters, .. }) => {
                    waiters.push(Arc::clone(&state));
                    pending += 1;
                    None
                }
                Some(Slot::Stale { refs }) => Some(*refs),
                None => Some(0),
            };
            if let Some(held) = reload {
                let job = self.inner.next_job.fetch_add(1, Ordering::Relaxed);
                let ticket = self.submit_load(job, &key, name, &loader, &sender);
                map.insert(
                    key.clone(),
                    Slot::Pending {
                        job,
                        ticket,
                        waiters: vec![Arc::clone(&state)],
                        held,
                    },
                );
                pending += 1;
                self.inner.jobs_issued.fetch_add(1, Ordering::Relaxed);
            }
            keys.push(key);
        }
        // Completions cannot run before the counter is set: the committer
        // needs the map lock, which is still held here
        *state.pending.lock() = pending;
        drop(map);

        debug!("Prefetch batch of {} files, {} pending", keys.len(), pending);
        Ok(PrefetchBatch {
            inner: Arc::clone(&self.inner),
            keys,
            state,
        })
    }

    fn submit_load(
        &self,
        job: u64,
        key: &str,
        name: &str,
        loader: &Loader,
        sender: &Sender<Completion>,
    ) -> Arc<JobTicket> {
        let loader = Arc::clone(loader);
        let sender = sender.clone();
        let key = key.to_string();
        let name = name.to_string();

        self.pool.submit(move || {
            let result = loader(&name);
            let _ = sender.send(Completion {
                key,
                name,
                job,
                result,
            });
        })
    }

    /// Peek at a published entry without taking a reference
    pub fn lookup(&self, name: &str) -> Option<Arc<CachedFile>> {
        let map = self.inner.map.lock();
        match map.get(&normalize_key(name)) {
            Some(Slot::Ready { file, .. }) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(file))
            }
            _ => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Publish `data` directly and take a reference on the result
    ///
    /// An already published entry wins and `data` is dropped. Batches waiting
    /// on an in-flight load of the same name are completed with `data`.
    pub fn insert(&self, name: &str, data: Vec<u8>) -> Arc<CachedFile> {
        let key = normalize_key(name);
        let mut map = self.inner.map.lock();

        let (held, waiters) = match map.remove(&key) {
            Some(Slot::Ready { file, refs }) => {
                map.insert(
                    key,
                    Slot::Ready {
                        file: Arc::clone(&file),
                        refs: refs + 1,
                    },
                );
                return file;
            }
            Some(Slot::Pending { waiters, held, .. }) => (held, waiters),
            Some(Slot::Stale { refs }) => (refs, Vec::new()),
            None => (0, Vec::new()),
        };
        let content = if data.is_empty() {
            CachedContent::Missing
        } else {
            CachedContent::Loaded(Arc::from(data))
        };
        let file = Arc::new(CachedFile {
            name: name.to_string(),
            content,
        });
        let refs = held + waiters.len() + 1;

        map.insert(
            key,
            Slot::Ready {
                file: Arc::clone(&file),
                refs,
            },
        );
        drop(map);

        for waiter in waiters {
            waiter.complete_one();
        }
        file
    }

    /// Forget published or in-flight content for `name`
    ///
    /// References held by batches stay counted, but lookups miss until the
    /// name is prefetched again. An in-flight load is cancelled and the
    /// batches waiting on it complete without it.
    pub fn invalidate(&self, name: &str) -> bool {
        let key = normalize_key(name);
        let mut map = self.inner.map.lock();
        let Some(slot) = map.remove(&key) else {
            return false;
        };
        let (refs, waiters, ticket) = match slot {
            Slot::Ready { refs, .. } | Slot::Stale { refs } => (refs, Vec::new(), None),
            Slot::Pending {
                ticket,
                waiters,
                held,
                ..
            } => (held + waiters.len(), waiters, Some(ticket)),
        };
        if refs > 0 {
            map.insert(key, Slot::Stale { refs });
        }
        drop(map);

        for waiter in waiters {
            waiter.complete_one();
        }
        if let Some(ticket) = ticket {
            if ticket.cancel() {
                trace!("Cancelled prefetch job {}", ticket.id());
            }
        }
        debug!("Invalidated cached {}", name);
        true
    }

    /// Drop one reference; returns whether the entry was removed
    pub fn release(&self, name: &str) -> bool {
        self.inner.release_key(&normalize_key(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(
            self.inner.map.lock().get(&normalize_key(name)),
            Some(Slot::Ready { .. })
        )
    }

    pub fn stats(&self) -> CacheStats {
        let map = self.inner.map.lock();
        let mut stats = CacheStats {
            jobs_issued: self.inner.jobs_issued.load(Ordering::Relaxed),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for slot in map.values() {
            if let Slot::Ready { file, .. } = slot {
                stats.entries += 1;
                stats.bytes += file.len();
            }
        }
        stats
    }

    /// Finish queued loads, then stop the workers and the committer
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.completions.lock().take();
        if let Some(handle) = self.committer.lock().take() {
            if handle.join().is_err() {
                warn!("Cache committer exited with a panic");
            }
        }
    }
}

impl Drop for MemoryFileCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn commit_loop(inner: Arc<CacheInner>, receiver: Receiver<Completion>) {
    for completion in receiver.iter() {
        inner.commit(completion);
    }
}

/// Files requested together; holds a reference on each until dropped
pub struct PrefetchBatch {
    inner: Arc<CacheInner>,
    keys: Vec<String>,
    state: Arc<BatchState>,
}

impl PrefetchBatch {
    /// No file of the batch is still loading
    pub fn is_ready(&self) -> bool {
        *self.state.pending.lock() == 0
    }

    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }

    /// Block until every file of the batch is published
    pub fn wait(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.ready.wait(&mut pending);
        }
    }

    /// Normalized names held by the batch
    pub fn names(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for PrefetchBatch {
    fn drop(&mut self) {
        self.inner.release_batch(&self.keys, &self.state);
    }
}

impl std::fmt::Debug for PrefetchBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchBatch")
            .field("files", &self.keys.len())
            .field("pending", &self.pending())
            .finish()
    }
}
