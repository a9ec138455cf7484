//! # pakfs - Layered search-path virtual filesystem
//!
//! `pakfs` builds one logical namespace out of an ordered list of search
//! paths. Each search path is a loose directory or a mounted archive, tagged
//! with a group name. Opening a file walks the list in order and the first
//! entry holding the name wins.
//!
//! - **Two archive formats**: sequential `.pak` containers (stored, LZ4 or
//!   Zstd entries, also mountable from inside a host file) and indexed `.idx`
//!   stores with SHA-256 per entry and an optional Ed25519 signature
//! - **Integrity tracking**: the first load of every file records its content
//!   hash and whether its source was trusted
//! - **Whitelist**: trusted signer keys plus per-name rules that restrict a
//!   file to trusted sources
//! - **Prefetch**: background loads into a shared memory cache
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pakfs::{FileSystem, OpenMode, Result, SearchPosition};
//! use std::io::Read;
//!
//! # fn main() -> Result<()> {
//! let fs = FileSystem::builder().base_dir("/srv/game").build()?;
//! fs.add_search_path("mods/custom", "game", SearchPosition::Tail);
//! fs.add_search_path("base.pak", "game", SearchPosition::Tail);
//!
//! let mut handle = fs.open("cfg/settings.txt", OpenMode::Read, None)?;
//! let mut text = String::new();
//! handle.read_to_string(&mut text)?;
//!
//! for entry in fs.find("cfg/*.txt", Some("game")) {
//!     println!("{} (dir: {})", entry.name, entry.is_dir);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Prefetch
//!
//! ```rust,no_run
//! use pakfs::{FileSystem, Result, SearchPosition};
//!
//! # fn main() -> Result<()> {
//! let fs = FileSystem::builder().base_dir("/srv/game").build()?;
//! fs.add_search_path("base.pak", "game", SearchPosition::Tail);
//!
//! let batch = fs.prefetch_files(["maps/start.bsp", "cfg/settings.txt"], None)?;
//! batch.wait();
//! // Served from memory while the batch is alive
//! let data = fs.read_file("cfg/settings.txt", None)?;
//! fs.destroy_batch(batch);
//! # let _ = data;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    archive::{sequential::EmbeddedWindow, ArchiveKind},
    cache::{CacheStats, PrefetchBatch},
    config::FsConfig,
    context::FsContext,
    error::{FsError, Result},
    find::{FindEntry, FindSession},
    handle::{FileHandle, LoadSource, OpenMode, SourceKind},
    hash::ContentHash,
    integrity::{ArchiveReport, IntegrityRecord},
    io::IoCounters,
    pattern::PatternMatcher,
    registry::{ArchiveFilter, SearchPathInfo, SearchPosition, StoreId},
    resolver::{OpenRequest, TrustRequirement},
    whitelist::{IntegrityClass, IntegrityRule, Whitelist},
};

use crate::core::cache::Loader;
use crate::core::integrity::verify_archive;
use crate::core::resolver::{clean_name, effective_group, split_group_prefix};
use crate::core::symbol::normalize_key;
use ahash::AHashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// A layered filesystem instance
///
/// Owns its search path, memory cache and integrity records. Independent
/// instances share nothing.
pub struct FileSystem {
    ctx: Arc<FsContext>,
}

impl FileSystem {
    pub fn new(config: FsConfig) -> Result<Self> {
        let ctx = FsContext::new(config)?;
        info!(
            "Filesystem ready (base {}, {} read workers)",
            ctx.config.base_dir.display(),
            ctx.config.worker_threads
        );
        Ok(FileSystem { ctx: Arc::new(ctx) })
    }

    pub fn builder() -> FileSystemBuilder {
        FileSystemBuilder::new()
    }

    pub fn config(&self) -> &FsConfig {
        &self.ctx.config
    }

    /// Shared state, for callers that drive the resolver directly
    pub fn context(&self) -> &FsContext {
        &self.ctx
    }

    // --- Opening files ---

    /// Open `name` for `mode`, optionally limited to one group
    pub fn open(&self, name: &str, mode: OpenMode, group: Option<&str>) -> Result<FileHandle> {
        self.ctx.resolver().open(name, mode, group)
    }

    /// Open with an explicit trust requirement
    pub fn open_with(&self, request: OpenRequest<'_>) -> Result<FileHandle> {
        self.ctx.resolver().open_with(request)
    }

    /// Read a whole file
    pub fn read_file(&self, name: &str, group: Option<&str>) -> Result<Vec<u8>> {
        self.ctx.resolver().read_to_vec(name, group)
    }

    /// Create or replace a file in the first writable search path
    pub fn write_file(&self, name: &str, group: Option<&str>, data: &[u8]) -> Result<()> {
        self.ctx.resolver().write_all(name, group, data)
    }

    pub fn exists(&self, name: &str, group: Option<&str>) -> bool {
        self.ctx.resolver().exists(name, group)
    }

    /// Which source a read of `name` would be served from
    pub fn resolve_location(&self, name: &str, group: Option<&str>) -> Option<LoadSource> {
        self.ctx.resolver().resolve_location(name, group)
    }

    // --- Search path ---

    /// Add a directory or archive; returns whether it is mounted afterwards
    pub fn add_search_path(&self, location: &str, group: &str, position: SearchPosition) -> bool {
        let added = self.ctx.registry.add_path(location, group, position);
        if added {
            self.ctx.refresh_trust();
        }
        added
    }

    /// Mount a file as an archive whatever its suffix
    pub fn add_archive(&self, path: &str, group: &str, position: SearchPosition) -> bool {
        let added = self.ctx.registry.add_archive(path, group, position);
        if added {
            self.ctx.refresh_trust();
        }
        added
    }

    /// Mount a sequential archive living inside `host`
    pub fn add_embedded_archive(
        &self,
        host: &str,
        window: EmbeddedWindow,
        group: &str,
        position: SearchPosition,
    ) -> bool {
        let added = self
            .ctx
            .registry
            .add_embedded_archive(host, window, group, position);
        if added {
            self.ctx.refresh_trust();
        }
        added
    }

    /// Remove a directory or archive, from one group or all of them
    pub fn remove_search_path(&self, location: &str, group: Option<&str>) -> usize {
        self.ctx.registry.remove_path(location, group)
    }

    pub fn remove_embedded_archive(&self, host: &str, window: EmbeddedWindow, group: Option<&str>) -> usize {
        self.ctx.registry.remove_embedded_archive(host, window, group)
    }

    pub fn remove_all_search_paths_for_group(&self, group: &str) -> usize {
        self.ctx.registry.remove_group(group)
    }

    pub fn clear_search_paths(&self) -> usize {
        self.ctx.registry.clear()
    }

    /// Current search path, in resolution order
    pub fn search_paths(&self) -> Vec<SearchPathInfo> {
        self.ctx.registry.entries()
    }

    // --- Enumeration ---

    /// Start listing `wildcard`; `None` when nothing matches
    pub fn find_first(&self, wildcard: &str, group: Option<&str>) -> Option<(FindEntry, FindSession)> {
        let mut session = self.find(wildcard, group);
        let first = session.find_next()?;
        Some((first, session))
    }

    pub fn find_next(&self, session: &mut FindSession) -> Option<FindEntry> {
        session.find_next()
    }

    pub fn find_close(&self, session: FindSession) {
        debug!("Closed {:?}", session);
    }

    /// Iterator over every name matching `wildcard`
    pub fn find(&self, wildcard: &str, group: Option<&str>) -> FindSession {
        let group = effective_group(group).map(|g| self.ctx.paths.intern(g));
        FindSession::new(self.ctx.registry.snapshot(), wildcard, group)
    }

    // --- Trust ---

    /// Install a whitelist and return the files that must be reloaded
    pub fn set_whitelist(&self, whitelist: Whitelist) -> Vec<String> {
        self.ctx.set_whitelist(whitelist)
    }

    pub fn whitelist(&self) -> Arc<Whitelist> {
        self.ctx.whitelist()
    }

    pub fn integrity_records(&self) -> Vec<IntegrityRecord> {
        self.ctx.integrity.records()
    }

    pub fn integrity_record(&self, name: &str, group: &str) -> Option<IntegrityRecord> {
        self.ctx.integrity.record_for(name, group)
    }

    /// Re-check every mounted archive
    pub fn verify_archives(&self) -> Vec<ArchiveReport> {
        let snapshot = self.ctx.registry.snapshot();
        let mut reports: Vec<ArchiveReport> = Vec::new();
        for entry in snapshot.filtered(None, ArchiveFilter::ExcludeLoose) {
            if let Some(report) = verify_archive(entry) {
                reports.push(report);
            }
        }
        reports
    }

    // --- Memory cache ---

    /// Load `names` into the memory cache in the background
    ///
    /// The files stay cached until the returned batch is dropped or passed
    /// to [`destroy_batch`](Self::destroy_batch). Names are cached under the
    /// same form [`open`](Self::open) looks them up by; a `//group/` prefix
    /// picks the group that name is loaded from.
    pub fn prefetch_files<I, S>(&self, names: I, group: Option<&str>) -> Result<PrefetchBatch>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cleaned = Vec::new();
        let mut groups: AHashMap<String, Option<String>> = AHashMap::new();
        for name in names {
            let (name, name_group) = split_group_prefix(name.as_ref(), group);
            let name = clean_name(name);
            groups
                .entry(normalize_key(&name))
                .or_insert_with(|| name_group.map(str::to_string));
            cleaned.push(name);
        }

        let ctx: Weak<FsContext> = Arc::downgrade(&self.ctx);
        let loader: Loader = Arc::new(move |name: &str| {
            let ctx = ctx.upgrade().ok_or_else(|| {
                FsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "filesystem dropped",
                ))
            })?;
            let group = groups.get(&normalize_key(name)).cloned().flatten();
            ctx.resolver().read_uncached(name, group.as_deref())
        });
        self.ctx.cache.prefetch(cleaned, loader)
    }

    pub fn is_batch_ready(&self, batch: &PrefetchBatch) -> bool {
        batch.is_ready()
    }

    /// Release a batch; loads nobody else waits for are cancelled
    pub fn destroy_batch(&self, batch: PrefetchBatch) {
        drop(batch);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats()
    }

    pub fn io_counters(&self) -> &Arc<IoCounters> {
        self.ctx.registry.io_counters()
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        // Background loads hold the context; stop them on this thread
        self.ctx.cache.shutdown();
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FileSystem").field(&self.ctx).finish()
    }
}

/// Builder for [`FileSystem`]
///
/// # Examples
///
/// ```rust,no_run
/// use pakfs::{FileSystem, SearchPosition};
///
/// # fn main() -> pakfs::Result<()> {
/// let fs = FileSystem::builder()
///     .base_dir("/srv/game")
///     .worker_threads(4)
///     .search_path("base.pak", "game")
///     .search_path("user", "default_write_path")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FileSystemBuilder {
    config: FsConfig,
    search_paths: Vec<(String, String)>,
    whitelist: Option<Whitelist>,
}

impl FileSystemBuilder {
    pub fn new() -> Self {
        FileSystemBuilder {
            config: FsConfig::default(),
            search_paths: Vec::new(),
            whitelist: None,
        }
    }

    /// Start from a loaded configuration
    pub fn config(mut self, config: FsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.base_dir = dir.into();
        self
    }

    pub fn case_sensitive_root<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.case_sensitive_root = Some(dir.into());
        self
    }

    pub fn default_write_group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.default_write_group = group.into();
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn track_integrity(mut self, enabled: bool) -> Self {
        self.config.track_integrity = enabled;
        self
    }

    /// Append a search path; applied in call order by `build`
    pub fn search_path<L: Into<String>, G: Into<String>>(mut self, location: L, group: G) -> Self {
        self.search_paths.push((location.into(), group.into()));
        self
    }

    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    pub fn build(self) -> Result<FileSystem> {
        let fs = FileSystem::new(self.config)?;
        if let Some(whitelist) = self.whitelist {
            fs.set_whitelist(whitelist);
        }
        for (location, group) in &self.search_paths {
            fs.add_search_path(location, group, SearchPosition::Tail);
        }
        Ok(fs)
    }
}

impl Default for FileSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
