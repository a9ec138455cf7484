//! Directory enumeration across the search path
//!
//! A [`FindSession`] walks one registry snapshot in order. Loose directories
//! are streamed one `read_dir` item at a time; an archive is asked once for
//! every matching name and the result is drained (directories first). Names
//! already produced by an earlier entry are skipped, ignoring case.
//!
//! ```text
//! Start ──▶ Scanning(i) ──▶ Draining(i) ──▶ Scanning(i+1) ... ──▶ Done
//! ```

use crate::core::archive::ArchiveReader;
use crate::core::pattern::{split_wildcard, PatternMatcher};
use crate::core::registry::{RegistrySnapshot, SearchPathEntry, StoreId};
use crate::core::symbol::PathSymbol;
use ahash::AHashSet;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::ReadDir;
use std::path::PathBuf;
use tracing::{debug, trace};

/// One enumerated name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindEntry {
    /// Last path segment, as stored
    pub name: String,
    pub is_dir: bool,
    /// Directory or archive that produced the name
    pub location: PathBuf,
    pub from_archive: bool,
}

enum FindState {
    Start,
    Scanning { index: usize, dir: ReadDir },
    Draining { index: usize, pending: VecDeque<FindEntry> },
    Done,
}

/// Merged, de-duplicated listing of one wildcard
pub struct FindSession {
    snapshot: RegistrySnapshot,
    group: Option<PathSymbol>,
    dir: String,
    file_pattern: String,
    state: FindState,
    visited_stores: AHashSet<StoreId>,
    scanned: usize,
    seen: AHashSet<String>,
}

impl FindSession {
    pub(crate) fn new(snapshot: RegistrySnapshot, wildcard: &str, group: Option<PathSymbol>) -> Self {
        let (dir, file_pattern) = split_wildcard(wildcard);
        debug!("Find '{}' in '{}' over {} entries", file_pattern, dir, snapshot.len());
        FindSession {
            snapshot,
            group,
            dir,
            file_pattern,
            state: FindState::Start,
            visited_stores: AHashSet::new(),
            scanned: 0,
            seen: AHashSet::new(),
        }
    }

    /// Directory part of the wildcard
    pub fn directory(&self) -> &str {
        &self.dir
    }

    /// Search path entries visited so far, not counting repeated stores
    pub fn entries_scanned(&self) -> usize {
        self.scanned
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, FindState::Done)
    }

    /// Produce the next name, or `None` once every entry is exhausted
    pub fn find_next(&mut self) -> Option<FindEntry> {
        loop {
            let state = std::mem::replace(&mut self.state, FindState::Done);
            match state {
                FindState::Done => return None,
                FindState::Start => self.state = self.enter(0),
                FindState::Scanning { index, mut dir } => {
                    let location = self.snapshot[index].os_path.join(&self.dir);
                    match dir.next() {
                        None => self.state = self.enter(index + 1),
                        Some(Err(e)) => {
                            trace!("Skipping unreadable item in {}: {}", location.display(), e);
                            self.state = FindState::Scanning { index, dir };
                        }
                        Some(Ok(item)) => {
                            self.state = FindState::Scanning { index, dir };
                            let name = item.file_name().to_string_lossy().into_owned();
                            if !PatternMatcher::matches_segment(&self.file_pattern, &name) {
                                continue;
                            }
                            let is_dir = item.file_type().map(|t| t.is_dir()).unwrap_or(false);
                            let entry = FindEntry {
                                name,
                                is_dir,
                                location,
                                from_archive: false,
                            };
                            if self.first_sighting(&entry) {
                                return Some(entry);
                            }
                        }
                    }
                }
                FindState::Draining { index, mut pending } => match pending.pop_front() {
                    None => self.state = self.enter(index + 1),
                    Some(entry) => {
                        self.state = FindState::Draining { index, pending };
                        if self.first_sighting(&entry) {
                            return Some(entry);
                        }
                    }
                },
            }
        }
    }

    /// Start scanning the first admissible entry at or after `from`
    fn enter(&mut self, from: usize) -> FindState {
        for index in from..self.snapshot.len() {
            let entry = &self.snapshot[index];
            if self.group.is_some_and(|g| g != entry.group) {
                continue;
            }
            if !self.visited_stores.insert(entry.store_id) {
                trace!("Store {} already listed", entry.store_id.0);
                continue;
            }
            self.scanned += 1;
            match &entry.archive {
                Some(archive) => {
                    let pending = self.archive_matches(entry, archive.list_entries(&self.pattern()));
                    if !pending.is_empty() {
                        return FindState::Draining { index, pending };
                    }
                }
                None => {
                    let dir = entry.os_path.join(&self.dir);
                    match std::fs::read_dir(&dir) {
                        Ok(items) => return FindState::Scanning { index, dir: items },
                        Err(e) => trace!("Cannot list {}: {}", dir.display(), e),
                    }
                }
            }
        }
        FindState::Done
    }

    fn pattern(&self) -> String {
        if self.dir.is_empty() {
            self.file_pattern.clone()
        } else {
            format!("{}/{}", self.dir, self.file_pattern)
        }
    }

    fn archive_matches(
        &self,
        entry: &SearchPathEntry,
        listing: crate::core::archive::EntryListing,
    ) -> VecDeque<FindEntry> {
        let dirs = listing.dirs.into_iter().map(|name| (name, true));
        let files = listing.files.into_iter().map(|name| (name, false));
        dirs.chain(files)
            .map(|(name, is_dir)| FindEntry {
                name,
                is_dir,
                location: entry.os_path.clone(),
                from_archive: true,
            })
            .collect()
    }

    fn first_sighting(&mut self, entry: &FindEntry) -> bool {
        self.seen.insert(entry.name.to_ascii_lowercase())
    }
}

impl Iterator for FindSession {
    type Item = FindEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.find_next()
    }
}

impl std::fmt::Debug for FindSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindSession")
            .field("dir", &self.dir)
            .field("pattern", &self.file_pattern)
            .field("scanned", &self.scanned)
            .field("seen", &self.seen.len())
            .field("done", &self.is_done())
            .finish()
    }
}
