//! Search path registry
//!
//! An ordered list of search path entries. Each entry is a loose directory or
//! a shared [`ArchiveHandle`], tagged with a logical group. Entries that reach
//! the same physical location share a [`StoreId`].
//!
//! The list lives behind one mutex as an `Arc<Vec<_>>`. Structural changes
//! hold the lock for their whole duration and copy the vector if a reader
//! still holds the previous version; readers lock only long enough to clone
//! the `Arc` ([`SearchPathRegistry::snapshot`]) and then iterate privately.

use crate::core::archive::indexed::IndexedStore;
use crate::core::archive::sequential::{EmbeddedWindow, SequentialArchive};
use crate::core::archive::{Archive, ArchiveHandle, ArchiveKind, ArchiveReader};
use crate::core::config::FsConfig;
use crate::core::io::IoCounters;
use crate::core::symbol::{PathSymbol, PathTable};
use ahash::AHashSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity shared by all entries reaching one physical location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StoreId(pub u32);

/// Where a new entry goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPosition {
    Head,
    Tail,
}

/// Archive-vs-loose filter for iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchiveFilter {
    #[default]
    All,
    ExcludeArchives,
    ExcludeLoose,
}

impl ArchiveFilter {
    fn admits(self, entry: &SearchPathEntry) -> bool {
        match self {
            ArchiveFilter::All => true,
            ArchiveFilter::ExcludeArchives => entry.archive.is_none(),
            ArchiveFilter::ExcludeLoose => entry.archive.is_some(),
        }
    }
}

/// One (location, group) pair in resolution order
#[derive(Debug, Clone)]
pub struct SearchPathEntry {
    /// Position in the registry at the time of the snapshot
    pub ordinal: usize,
    pub location: PathSymbol,
    pub group: PathSymbol,
    pub store_id: StoreId,
    pub archive: Option<ArchiveHandle>,
    pub trusted: bool,
    /// Directory (with the caller's case) or archive file on disk
    pub os_path: PathBuf,
}

impl SearchPathEntry {
    pub fn is_archive(&self) -> bool {
        self.archive.is_some()
    }

    /// Only loose directories accept writes
    pub fn is_writable(&self) -> bool {
        self.archive.is_none()
    }
}

/// Printable description of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchPathInfo {
    pub ordinal: usize,
    pub location: String,
    pub group: String,
    pub store_id: StoreId,
    pub kind: &'static str,
    pub trusted: bool,
    pub writable: bool,
}

/// Immutable view of the registry at one point in time
#[derive(Debug, Clone)]
pub struct RegistrySnapshot(Arc<Vec<SearchPathEntry>>);

impl RegistrySnapshot {
    /// Entries in registration order, filtered, each store visited once
    pub fn filtered(&self, group: Option<PathSymbol>, filter: ArchiveFilter) -> SearchPathIter<'_> {
        SearchPathIter {
            entries: &self.0,
            pos: 0,
            group,
            filter,
            visited: AHashSet::new(),
        }
    }
}

impl Deref for RegistrySnapshot {
    type Target = [SearchPathEntry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Lazy filtered iteration over a snapshot
pub struct SearchPathIter<'a> {
    entries: &'a [SearchPathEntry],
    pos: usize,
    group: Option<PathSymbol>,
    filter: ArchiveFilter,
    visited: AHashSet<StoreId>,
}

impl<'a> Iterator for SearchPathIter<'a> {
    type Item = &'a SearchPathEntry;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.entries.get(self.pos) {
            self.pos += 1;
            if self.group.is_some_and(|g| g != entry.group) || !self.filter.admits(entry) {
                continue;
            }
            if self.visited.insert(entry.store_id) {
                return Some(entry);
            }
        }
        None
    }
}

struct RegistryState {
    entries: Arc<Vec<SearchPathEntry>>,
    next_store: u32,
}

impl RegistryState {
    fn allocate_store(&mut self) -> StoreId {
        let id = StoreId(self.next_store);
        self.next_store += 1;
        id
    }

    fn insert(&mut self, entry: SearchPathEntry, position: SearchPosition) {
        let entries = Arc::make_mut(&mut self.entries);
        match position {
            SearchPosition::Head => entries.insert(0, entry),
            SearchPosition::Tail => entries.push(entry),
        }
        renumber(entries);
    }

    /// Archive handle and store already mounted at `location`
    fn shared_archive(&self, location: PathSymbol) -> Option<(StoreId, ArchiveHandle, bool)> {
        self.entries.iter().find_map(|e| {
            let archive = e.archive.as_ref().filter(|_| e.location == location)?;
            Some((e.store_id, Arc::clone(archive), e.trusted))
        })
    }
}

fn renumber(entries: &mut [SearchPathEntry]) {
    for (ordinal, entry) in entries.iter_mut().enumerate() {
        entry.ordinal = ordinal;
    }
}

/// Ordered search path list
pub struct SearchPathRegistry {
    config: Arc<FsConfig>,
    paths: Arc<PathTable>,
    state: Mutex<RegistryState>,
    counters: Arc<IoCounters>,
}

impl SearchPathRegistry {
    pub fn new(config: Arc<FsConfig>, paths: Arc<PathTable>) -> Self {
        SearchPathRegistry {
            config,
            paths,
            state: Mutex::new(RegistryState {
                entries: Arc::new(Vec::new()),
                next_store: 0,
            }),
            counters: IoCounters::new(),
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot(Arc::clone(&self.state.lock().entries))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paths(&self) -> &Arc<PathTable> {
        &self.paths
    }

    /// Descriptor open/close counters for every archive this registry mounts
    pub fn io_counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// Add a loose directory, or an archive when the suffix names one
    ///
    /// Returns whether the location is mounted afterwards. Re-adding an
    /// existing (location, group) pair moves it to the requested end.
    pub fn add_path(&self, location: &str, group: &str, position: SearchPosition) -> bool {
        let raw = location.replace('\\', "/");
        if let Some(kind) = self.config.archive_kind_for(Path::new(&raw)) {
            return self.mount_archive(Path::new(&raw), kind, group, position);
        }

        let dir = self.absolute(Path::new(&raw));
        let location = self.dir_symbol(&dir);
        let group_sym = self.paths.intern(group);
        let mut state = self.state.lock();

        let existing = state
            .entries
            .iter()
            .position(|e| e.archive.is_none() && e.location == location && e.group == group_sym);
        if let Some(idx) = existing {
            let at_end = match position {
                SearchPosition::Head => idx == 0,
                SearchPosition::Tail => idx + 1 == state.entries.len(),
            };
            if !at_end {
                let entry = Arc::make_mut(&mut state.entries).remove(idx);
                state.insert(entry, position);
                debug!("Moved search path {} ({}) to {:?}", dir.display(), group, position);
            }
            return true;
        }

        let sibling = state
            .entries
            .iter()
            .find(|e| e.archive.is_none() && e.location == location)
            .map(|e| e.store_id);
        let store_id = match sibling {
            Some(id) => id,
            None => state.allocate_store(),
        };

        state.insert(
            SearchPathEntry {
                ordinal: 0,
                location,
                group: group_sym,
                store_id,
                archive: None,
                trusted: false,
                os_path: dir.clone(),
            },
            position,
        );
        info!("Added search path {} ({})", dir.display(), group);
        true
    }

    /// Mount an archive file
    ///
    /// Unknown suffixes are read as sequential archives. A missing, empty or
    /// malformed archive is skipped with a warning and `false` is returned.
    pub fn add_archive(&self, path: &str, group: &str, position: SearchPosition) -> bool {
        let raw = path.replace('\\', "/");
        let kind = self
            .config
            .archive_kind_for(Path::new(&raw))
            .unwrap_or(ArchiveKind::Sequential);
        self.mount_archive(Path::new(&raw), kind, group, position)
    }

    /// Mount a sequential archive embedded at `window` inside `host`
    pub fn add_embedded_archive(
        &self,
        host: &str,
        window: EmbeddedWindow,
        group: &str,
        position: SearchPosition,
    ) -> bool {
        let host = self.absolute(Path::new(&host.replace('\\', "/")));
        let map_embedded = self.config.is_map_host(&host);
        let location = self.embedded_symbol(&host, window);

        self.mount(location, &host, group, position, || {
            SequentialArchive::open_embedded(
                &host,
                window,
                map_embedded,
                &self.counters,
                self.config.max_entry_size,
            )
            .map(Archive::Sequential)
        })
    }

    fn mount_archive(&self, raw: &Path, kind: ArchiveKind, group: &str, position: SearchPosition) -> bool {
        let path = self.absolute(raw);
        let location = self.file_symbol(&path);

        self.mount(location, &path, group, position, || match kind {
            ArchiveKind::Sequential => {
                SequentialArchive::open(&path, &self.counters, self.config.max_entry_size)
                    .map(Archive::Sequential)
            }
            ArchiveKind::Indexed => IndexedStore::open(&path, &self.counters).map(Archive::Indexed),
        })
    }

    fn mount<F>(
        &self,
        location: PathSymbol,
        path: &Path,
        group: &str,
        position: SearchPosition,
        open: F,
    ) -> bool
    where
        F: FnOnce() -> crate::core::error::Result<Archive>,
    {
        let group_sym = self.paths.intern(group);
        let mut state = self.state.lock();

        let (store_id, archive, trusted) = match state.shared_archive(location) {
            Some(shared) => {
                let duplicate = state
                    .entries
                    .iter()
                    .any(|e| e.archive.is_some() && e.location == location && e.group == group_sym);
                if duplicate {
                    debug!("Archive {} already mounted for {}", path.display(), group);
                    return true;
                }
                shared
            }
            None => match open() {
                Ok(archive) => (state.allocate_store(), Arc::new(archive), false),
                Err(e) => {
                    warn!("Skipping archive {}: {}", path.display(), e);
                    return false;
                }
            },
        };

        let entries = archive.entry_count();
        state.insert(
            SearchPathEntry {
                ordinal: 0,
                location,
                group: group_sym,
                store_id,
                archive: Some(archive),
                trusted,
                os_path: path.to_path_buf(),
            },
            position,
        );
        info!(
            "Mounted archive {} ({}, {} entries, store {})",
            path.display(),
            group,
            entries,
            store_id.0
        );
        true
    }

    /// Remove loose entries for `location` (archives by suffix), optionally only one group
    pub fn remove_path(&self, location: &str, group: Option<&str>) -> usize {
        let raw = location.replace('\\', "/");
        if self.config.archive_kind_for(Path::new(&raw)).is_some() {
            return self.remove_archive(&raw, group);
        }
        let dir = self.absolute(Path::new(&raw));
        let Some(location) = self.known_dir_symbol(&dir) else {
            return 0;
        };
        self.remove_where(group, |e| e.archive.is_none() && e.location == location)
    }

    pub fn remove_archive(&self, path: &str, group: Option<&str>) -> usize {
        let path = self.absolute(Path::new(&path.replace('\\', "/")));
        let Some(location) = self.paths.get_verbatim(&self.file_label(&path)) else {
            return 0;
        };
        self.remove_where(group, |e| e.archive.is_some() && e.location == location)
    }

    pub fn remove_embedded_archive(&self, host: &str, window: EmbeddedWindow, group: Option<&str>) -> usize {
        let host = self.absolute(Path::new(&host.replace('\\', "/")));
        let label = format!("{}@{}+{}", self.file_label(&host), window.offset, window.length);
        let Some(location) = self.paths.get_verbatim(&label) else {
            return 0;
        };
        self.remove_where(group, |e| e.archive.is_some() && e.location == location)
    }

    /// Remove every entry tagged with `group`
    pub fn remove_group(&self, group: &str) -> usize {
        self.remove_where(Some(group), |_| true)
    }

    /// Drop everything; archive handles close once no snapshot holds them
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries = Arc::new(Vec::new());
        removed
    }

    fn remove_where<F>(&self, group: Option<&str>, matches: F) -> usize
    where
        F: Fn(&SearchPathEntry) -> bool,
    {
        let group_sym = match group {
            Some(g) => match self.paths.get(g) {
                Some(sym) => Some(sym),
                None => return 0,
            },
            None => None,
        };
        let hit = |e: &SearchPathEntry| matches(e) && group_sym.map_or(true, |g| e.group == g);

        let mut state = self.state.lock();
        if !state.entries.iter().any(|e| hit(e)) {
            return 0;
        }

        let entries = Arc::make_mut(&mut state.entries);
        let mut removed = 0;
        for idx in (0..entries.len()).rev() {
            if hit(&entries[idx]) {
                let entry = entries.remove(idx);
                debug!(
                    "Removed search path {} (store {})",
                    entry.os_path.display(),
                    entry.store_id.0
                );
                removed += 1;
            }
        }
        renumber(entries);
        removed
    }

    /// Recompute every entry's trusted flag; returns how many changed
    pub fn update_trust<F>(&self, evaluate: F) -> usize
    where
        F: Fn(&SearchPathEntry) -> bool,
    {
        let mut state = self.state.lock();
        let verdicts: Vec<bool> = state.entries.iter().map(&evaluate).collect();
        if state.entries.iter().zip(&verdicts).all(|(e, v)| e.trusted == *v) {
            return 0;
        }

        let mut changed = 0;
        for (entry, trusted) in Arc::make_mut(&mut state.entries).iter_mut().zip(verdicts) {
            if entry.trusted != trusted {
                entry.trusted = trusted;
                changed += 1;
            }
        }
        changed
    }

    /// Printable listing of the current search path
    pub fn entries(&self) -> Vec<SearchPathInfo> {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .map(|e| SearchPathInfo {
                ordinal: e.ordinal,
                location: e.os_path.display().to_string(),
                group: self.paths.resolve(e.group).to_string(),
                store_id: e.store_id,
                kind: match e.archive.as_deref().map(Archive::kind) {
                    None => "loose",
                    Some(ArchiveKind::Sequential) => "sequential",
                    Some(ArchiveKind::Indexed) => "indexed",
                },
                trusted: e.trusted,
                writable: e.is_writable(),
            })
            .collect()
    }

    /// Absolute, lexically normalized form of a location
    fn absolute(&self, raw: &Path) -> PathBuf {
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.config.base_dir.join(raw)
        };

        let mut out = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other.as_os_str()),
            }
        }
        out
    }

    fn dir_label(dir: &Path) -> String {
        let mut label = dir.to_string_lossy().replace('\\', "/");
        if !label.ends_with('/') {
            label.push('/');
        }
        label
    }

    fn file_label(&self, path: &Path) -> String {
        let label = path.to_string_lossy().replace('\\', "/");
        if self.config.is_case_sensitive(path) {
            label
        } else {
            label.to_ascii_lowercase()
        }
    }

    fn dir_symbol(&self, dir: &Path) -> PathSymbol {
        let label = Self::dir_label(dir);
        if self.config.is_case_sensitive(dir) {
            self.paths.intern_verbatim(&label)
        } else {
            self.paths.intern(&label)
        }
    }

    fn known_dir_symbol(&self, dir: &Path) -> Option<PathSymbol> {
        let label = Self::dir_label(dir);
        if self.config.is_case_sensitive(dir) {
            self.paths.get_verbatim(&label)
        } else {
            self.paths.get(&label)
        }
    }

    fn file_symbol(&self, path: &Path) -> PathSymbol {
        self.paths.intern_verbatim(&self.file_label(path))
    }

    fn embedded_symbol(&self, host: &Path, window: EmbeddedWindow) -> PathSymbol {
        let label = format!("{}@{}+{}", self.file_label(host), window.offset, window.length);
        self.paths.intern_verbatim(&label)
    }
}
