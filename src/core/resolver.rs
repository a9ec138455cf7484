//! File resolution
//!
//! [`FileResolver::open`] turns a logical name, mode and optional group into
//! an open [`FileHandle`]:
//!
//! 1. `//group/name` names carry their own group. The group `default`
//!    means no group.
//! 2. Plain reads first probe the memory cache. A cached miss fails fast.
//! 3. Reads walk the registry snapshot in order; the first entry holding the
//!    name wins, whether it is loose or archived. Entries that hold the name
//!    but fail the trust requirement are skipped and reported.
//! 4. Writes go to the first writable entry of `<group>_write`, then
//!    `<group>`, then the default write group, then any writable entry.
//!    Any cached copy of the name is invalidated.
//!
//! Absolute names that point inside a mounted archive
//! (`/data/base.pak/cfg/settings.txt`) open that archive entry directly.

use crate::core::archive::ArchiveReader;
use crate::core::context::FsContext;
use crate::core::error::{FsError, Result};
use crate::core::handle::{FileHandle, LoadSource, OpenMode, SourceKind};
use crate::core::integrity::HashSource;
use crate::core::registry::{ArchiveFilter, RegistrySnapshot, SearchPathEntry};
use crate::core::whitelist::IntegrityClass;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Group name that selects the whole search path
pub const DEFAULT_GROUP: &str = "default";

/// Which sources a read may be served from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustRequirement {
    /// Whatever the whitelist's integrity class for the name says
    #[default]
    Policy,
    Any,
    TrustedOnly,
}

/// Arguments to [`FileResolver::open_with`]
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub name: &'a str,
    pub mode: OpenMode,
    pub group: Option<&'a str>,
    pub trust: TrustRequirement,
}

impl<'a> OpenRequest<'a> {
    pub fn new(name: &'a str, mode: OpenMode) -> Self {
        OpenRequest {
            name,
            mode,
            group: None,
            trust: TrustRequirement::Policy,
        }
    }

    pub fn read(name: &'a str) -> Self {
        Self::new(name, OpenMode::Read)
    }

    pub fn group(mut self, group: Option<&'a str>) -> Self {
        self.group = group;
        self
    }

    pub fn trust(mut self, trust: TrustRequirement) -> Self {
        self.trust = trust;
        self
    }
}

/// Split a `//group/name` override out of `name`
///
/// The embedded group wins over `group`; supplying both is logged. Empty
/// and [`DEFAULT_GROUP`] groups come back as `None`.
pub fn split_group_prefix<'a>(name: &'a str, group: Option<&'a str>) -> (&'a str, Option<&'a str>) {
    let group = effective_group(group);
    let Some(rest) = name.strip_prefix("//").or_else(|| name.strip_prefix("\\\\")) else {
        return (name, group);
    };
    match rest.split_once(['/', '\\']) {
        Some((embedded, file)) if !embedded.is_empty() => {
            if let Some(explicit) = group {
                warn!(
                    "Group '{}' in '{}' overrides explicit group '{}'",
                    embedded, name, explicit
                );
            }
            (file, effective_group(Some(embedded)))
        }
        _ => (rest, group),
    }
}

/// `group` with empty and [`DEFAULT_GROUP`] names dropped
pub(crate) fn effective_group(group: Option<&str>) -> Option<&str> {
    group.filter(|g| !g.is_empty() && !g.eq_ignore_ascii_case(DEFAULT_GROUP))
}

/// Resolves names against one filesystem context
pub struct FileResolver<'a> {
    ctx: &'a FsContext,
}

impl<'a> FileResolver<'a> {
    pub fn new(ctx: &'a FsContext) -> Self {
        FileResolver { ctx }
    }

    pub fn open(&self, name: &str, mode: OpenMode, group: Option<&str>) -> Result<FileHandle> {
        self.open_with(OpenRequest::new(name, mode).group(group))
    }

    pub fn open_with(&self, request: OpenRequest<'_>) -> Result<FileHandle> {
        let (name, group) = split_group_prefix(request.name, request.group);
        let name = clean_name(name);
        debug!(
            "Open {} ({}, group {})",
            name,
            request.mode,
            group.unwrap_or("*")
        );

        if request.mode.is_read_only() {
            let requires_trust = self.requires_trust(&name, request.trust);
            if group.is_none() && !requires_trust {
                if let Some(file) = self.ctx.cache.lookup(&name) {
                    return match file.data() {
                        Some(data) => Ok(FileHandle::memory(data.clone())),
                        None => Err(not_found(&name, group, request.mode)),
                    };
                }
            }
            self.search_read(&name, group, requires_trust)
        } else {
            self.open_for_write(&name, group, request.mode)
        }
    }

    /// Read a file from the search path, bypassing the memory cache
    pub fn read_uncached(&self, name: &str, group: Option<&str>) -> Result<Vec<u8>> {
        let (name, group) = split_group_prefix(name, group);
        let name = clean_name(name);
        let requires_trust = self.requires_trust(&name, TrustRequirement::Policy);
        let mut handle = self.search_read(&name, group, requires_trust)?;
        Ok(handle.read_all()?)
    }

    pub fn read_to_vec(&self, name: &str, group: Option<&str>) -> Result<Vec<u8>> {
        let mut handle = self.open(name, OpenMode::Read, group)?;
        Ok(handle.read_all()?)
    }

    pub fn write_all(&self, name: &str, group: Option<&str>, data: &[u8]) -> Result<()> {
        let mut handle = self.open(name, OpenMode::Write, group)?;
        handle.write_all(data)?;
        handle.close()?;
        // A prefetch may have started while the handle was open
        let (name, _) = split_group_prefix(name, group);
        self.ctx.cache.invalidate(&clean_name(name));
        Ok(())
    }

    pub fn exists(&self, name: &str, group: Option<&str>) -> bool {
        self.resolve_location(name, group).is_some()
    }

    /// Which source would serve a read of `name`, without opening it
    pub fn resolve_location(&self, name: &str, group: Option<&str>) -> Option<LoadSource> {
        let (name, group) = split_group_prefix(name, group);
        let name = clean_name(name);
        let requires_trust = self.requires_trust(&name, TrustRequirement::Policy);

        if group.is_none() && !requires_trust {
            if let Some(file) = self.ctx.cache.lookup(&name) {
                return file.data().map(|_| LoadSource::memory());
            }
        }

        let snapshot = self.ctx.registry.snapshot();
        if Path::new(&name).is_absolute() {
            return match find_archive_entry(&snapshot, &name) {
                Some((entry, inner)) => {
                    let archive = entry.archive.as_ref()?;
                    (archive.contains(inner) && (entry.trusted || !requires_trust))
                        .then(|| self.source_for(entry, SourceKind::Archive))
                }
                None => (Path::new(&name).is_file() && !requires_trust)
                    .then(|| LoadSource::direct(Path::new(&name))),
            };
        }

        let group_sym = group.map(|g| self.ctx.paths.intern(g));
        snapshot
            .filtered(group_sym, ArchiveFilter::All)
            .filter(|entry| entry.trusted || !requires_trust)
            .find(|entry| entry_holds(entry, &name))
            .map(|entry| {
                let kind = if entry.is_archive() {
                    SourceKind::Archive
                } else {
                    SourceKind::Loose
                };
                self.source_for(entry, kind)
            })
    }

    fn requires_trust(&self, name: &str, trust: TrustRequirement) -> bool {
        match trust {
            TrustRequirement::Any => false,
            TrustRequirement::TrustedOnly => true,
            TrustRequirement::Policy => {
                self.ctx.whitelist().class_for(name) == IntegrityClass::TrustedOnly
            }
        }
    }

    fn search_read(&self, name: &str, group: Option<&str>, requires_trust: bool) -> Result<FileHandle> {
        let snapshot = self.ctx.registry.snapshot();
        let mut rejected = Vec::new();

        if Path::new(name).is_absolute() {
            return self.open_absolute(&snapshot, name, group, requires_trust);
        }

        let group_sym = group.map(|g| self.ctx.paths.intern(g));
        for entry in snapshot.filtered(group_sym, ArchiveFilter::All) {
            if requires_trust && !entry.trusted {
                if entry_holds(entry, name) {
                    debug!("Skipping untrusted {} for {}", entry.os_path.display(), name);
                    rejected.push(entry.os_path.display().to_string());
                }
                continue;
            }

            match self.open_in_entry(entry, name) {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {}
                Err(e) => warn!("Failed to open {} in {}: {}", name, entry.os_path.display(), e),
            }
        }

        if rejected.is_empty() {
            Err(not_found(name, group, OpenMode::Read))
        } else {
            Err(FsError::PolicyExcluded {
                name: name.to_string(),
                group: group.map(str::to_string),
                mode: OpenMode::Read,
                sources: rejected,
            })
        }
    }

    fn open_absolute(
        &self,
        snapshot: &RegistrySnapshot,
        name: &str,
        group: Option<&str>,
        requires_trust: bool,
    ) -> Result<FileHandle> {
        if let Some((entry, inner)) = find_archive_entry(snapshot, name) {
            if requires_trust && !entry.trusted {
                return Err(FsError::PolicyExcluded {
                    name: name.to_string(),
                    group: group.map(str::to_string),
                    mode: OpenMode::Read,
                    sources: vec![entry.os_path.display().to_string()],
                });
            }
            return self
                .open_in_entry(entry, inner)?
                .ok_or_else(|| not_found(name, group, OpenMode::Read));
        }

        let path = Path::new(name);
        if requires_trust {
            return Err(FsError::PolicyExcluded {
                name: name.to_string(),
                group: group.map(str::to_string),
                mode: OpenMode::Read,
                sources: vec![path.display().to_string()],
            });
        }
        match File::open(path) {
            Ok(file) if path.is_file() => Ok(FileHandle::loose(file, OpenMode::Read, LoadSource::direct(path))),
            Ok(_) => Err(not_found(name, group, OpenMode::Read)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(name, group, OpenMode::Read)),
            Err(e) => Err(e.into()),
        }
    }

    /// Open `name` inside one search path entry; `None` when it is not there
    fn open_in_entry(&self, entry: &SearchPathEntry, name: &str) -> Result<Option<FileHandle>> {
        let track = self.ctx.config.track_integrity;

        if let Some(archive) = &entry.archive {
            let Some(opened) = archive.open_entry(name)? else {
                return Ok(None);
            };
            if track {
                let source = match (opened.hash, opened.stream.as_bytes()) {
                    (Some(hash), _) => Some(HashSource::Known(hash)),
                    (None, Some(bytes)) => Some(HashSource::Bytes(bytes)),
                    (None, None) => None,
                };
                if let Some(source) = source {
                    self.record(entry, name, source);
                }
            }
            let source = self.source_for(entry, SourceKind::Archive);
            return Ok(Some(FileHandle::archive(opened.stream, source)));
        }

        let path = entry.os_path.join(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !file.metadata()?.is_file() {
            return Ok(None);
        }
        if track {
            self.record(entry, name, HashSource::Path(&path));
        }
        let source = self.source_for(entry, SourceKind::Loose);
        Ok(Some(FileHandle::loose(file, OpenMode::Read, source)))
    }

    fn record(&self, entry: &SearchPathEntry, name: &str, source: HashSource<'_>) {
        let group = self.ctx.paths.resolve(entry.group);
        if let Err(e) =
            self.ctx
                .integrity
                .record_load(name, &group, entry.store_id, source, entry.trusted)
        {
            warn!("Could not hash {} for integrity tracking: {}", name, e);
        }
    }

    fn open_for_write(&self, name: &str, group: Option<&str>, mode: OpenMode) -> Result<FileHandle> {
        self.ctx.cache.invalidate(name);
        if Path::new(name).is_absolute() {
            let path = PathBuf::from(name);
            let file = open_os(&path, mode)?;
            return Ok(FileHandle::loose(file, mode, LoadSource::direct(&path)));
        }

        let snapshot = self.ctx.registry.snapshot();
        let candidates = self.write_candidates(&snapshot, group);

        if mode == OpenMode::ReadUpdate {
            for entry in &candidates {
                let path = entry.os_path.join(name);
                if path.is_file() {
                    let file = open_os(&path, mode)?;
                    let source = self.source_for(entry, SourceKind::Loose);
                    return Ok(FileHandle::loose(file, mode, source));
                }
            }
            return Err(not_found(name, group, mode));
        }

        let Some(entry) = candidates.first() else {
            return Err(not_found(name, group, mode));
        };
        let path = entry.os_path.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| permission_or_io(parent, e))?;
        }
        let file = open_os(&path, mode)?;
        debug!("Opened {} for {} in {}", name, mode, entry.os_path.display());
        let source = self.source_for(entry, SourceKind::Loose);
        Ok(FileHandle::loose(file, mode, source))
    }

    /// Writable entries in fallback order, each once
    fn write_candidates<'s>(
        &self,
        snapshot: &'s RegistrySnapshot,
        group: Option<&str>,
    ) -> Vec<&'s SearchPathEntry> {
        let mut groups = Vec::new();
        if let Some(g) = group {
            groups.push(format!("{}_write", g));
            groups.push(g.to_string());
        }
        groups.push(self.ctx.config.default_write_group.clone());

        let mut out: Vec<&SearchPathEntry> = Vec::new();
        let mut push = |entry: &'s SearchPathEntry| {
            if !out.iter().any(|e| e.ordinal == entry.ordinal) {
                out.push(entry);
            }
        };
        for g in &groups {
            if let Some(sym) = self.ctx.paths.get(g) {
                snapshot
                    .filtered(Some(sym), ArchiveFilter::ExcludeArchives)
                    .for_each(&mut push);
            }
        }
        snapshot
            .filtered(None, ArchiveFilter::ExcludeArchives)
            .for_each(&mut push);
        out
    }

    fn source_for(&self, entry: &SearchPathEntry, kind: SourceKind) -> LoadSource {
        LoadSource {
            kind,
            location: entry.os_path.clone(),
            group: Some(self.ctx.paths.resolve(entry.group).to_string()),
            store_id: Some(entry.store_id),
            trusted: entry.trusted,
        }
    }
}

fn not_found(name: &str, group: Option<&str>, mode: OpenMode) -> FsError {
    FsError::NotFound {
        name: name.to_string(),
        group: group.map(str::to_string),
        mode,
    }
}

fn permission_or_io(path: &Path, e: std::io::Error) -> FsError {
    if e.kind() == ErrorKind::PermissionDenied {
        FsError::PermissionDenied {
            path: path.to_path_buf(),
            source: e,
        }
    } else {
        FsError::Io(e)
    }
}

fn open_os(path: &Path, mode: OpenMode) -> Result<File> {
    mode.options().open(path).map_err(|e| permission_or_io(path, e))
}

/// Slash-normalized name; relative names lose leading `./` and `/`
pub(crate) fn clean_name(name: &str) -> String {
    let name = name.replace('\\', "/");
    if Path::new(&name).is_absolute() {
        return name;
    }
    let mut out = PathBuf::new();
    for component in Path::new(&name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out.to_string_lossy().replace('\\', "/")
}

/// Whether `entry` has a file called `name`, without opening it
fn entry_holds(entry: &SearchPathEntry, name: &str) -> bool {
    match &entry.archive {
        Some(archive) => archive.contains(name),
        None => entry.os_path.join(name).is_file(),
    }
}

/// Mounted archive whose file path prefixes `name`, and the entry name inside it
fn find_archive_entry<'s, 'n>(
    snapshot: &'s RegistrySnapshot,
    name: &'n str,
) -> Option<(&'s SearchPathEntry, &'n str)> {
    snapshot.iter().filter(|e| e.is_archive()).find_map(|entry| {
        let prefix = entry.os_path.to_string_lossy().replace('\\', "/");
        let head = name.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(&prefix) {
            return None;
        }
        let inner = name[prefix.len()..].strip_prefix('/')?;
        (!inner.is_empty()).then_some((entry, inner))
    })
}
