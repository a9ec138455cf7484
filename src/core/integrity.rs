//! Integrity tracking
//!
//! The first time a file is loaded from disk or an archive its content hash
//! is recorded together with the store it came from and whether that store
//! was trusted. Records are never updated in place; a file whose record must
//! change is [`invalidate`](IntegrityTracker::invalidate)d and recorded again
//! on its next load.

use crate::core::archive::{Archive, ArchiveReader};
use crate::core::error::Result;
use crate::core::hash::ContentHash;
use crate::core::registry::{SearchPathEntry, SearchPathRegistry, StoreId};
use crate::core::symbol::normalize_key;
use crate::core::whitelist::{IntegrityClass, Whitelist};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Content hash of one loaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityRecord {
    pub filename: String,
    pub group: String,
    pub store_id: StoreId,
    pub hash: ContentHash,
    pub trusted: bool,
}

/// Where the hash for a record comes from
pub enum HashSource<'a> {
    /// Already known, e.g. stored in an indexed store
    Known(ContentHash),
    Bytes(&'a [u8]),
    /// Hash the file on disk
    Path(&'a Path),
}

impl HashSource<'_> {
    fn compute(self) -> Result<ContentHash> {
        Ok(match self {
            HashSource::Known(hash) => hash,
            HashSource::Bytes(data) => ContentHash::of(data),
            HashSource::Path(path) => ContentHash::of_reader(std::fs::File::open(path)?)?,
        })
    }
}

#[derive(Default)]
pub struct IntegrityTracker {
    records: Mutex<AHashMap<(String, String), IntegrityRecord>>,
}

impl IntegrityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a load unless (filename, group) already has a record
    ///
    /// Returns whether a new record was created. The hash is only computed
    /// for new records.
    pub fn record_load(
        &self,
        filename: &str,
        group: &str,
        store_id: StoreId,
        source: HashSource<'_>,
        trusted: bool,
    ) -> Result<bool> {
        let key = (normalize_key(filename), normalize_key(group));
        if self.records.lock().contains_key(&key) {
            return Ok(false);
        }

        // Hash outside the lock; a racing first load keeps its record
        let hash = source.compute()?;
        let mut records = self.records.lock();
        if records.contains_key(&key) {
            return Ok(false);
        }
        debug!("Recorded {} ({}) from store {}: {}", filename, group, store_id.0, hash);
        records.insert(
            key,
            IntegrityRecord {
                filename: filename.to_string(),
                group: group.to_string(),
                store_id,
                hash,
                trusted,
            },
        );
        Ok(true)
    }

    /// Whether files from `entry` count as coming from a trusted source
    pub fn evaluate_trust(entry: &SearchPathEntry, whitelist: &Whitelist) -> bool {
        match entry.archive.as_deref() {
            None => false,
            Some(Archive::Sequential(archive)) => archive.is_map_embedded(),
            Some(Archive::Indexed(store)) => match store.signer() {
                Some(signer) => whitelist.trusts_key(&signer) && store.signature_valid(),
                None => false,
            },
        }
    }

    /// Apply `whitelist` to the registry and list files that must be reloaded
    ///
    /// A file must be reloaded when its record came from a source that is no
    /// longer trusted, or when its name now requires a trusted source and it
    /// was not loaded from one.
    pub fn reconcile(&self, registry: &SearchPathRegistry, whitelist: &Whitelist) -> Vec<String> {
        let changed = registry.update_trust(|e| Self::evaluate_trust(e, whitelist));

        let snapshot = registry.snapshot();
        let trust: AHashMap<StoreId, bool> =
            snapshot.iter().map(|e| (e.store_id, e.trusted)).collect();

        let mut reload: Vec<String> = self
            .records
            .lock()
            .values()
            .filter(|record| {
                let now_trusted = trust.get(&record.store_id).copied().unwrap_or(false);
                let lost_trust = record.trusted && !now_trusted;
                let needs_trust = whitelist.class_for(&record.filename)
                    == IntegrityClass::TrustedOnly
                    && !now_trusted;
                lost_trust || needs_trust
            })
            .map(|record| record.filename.clone())
            .collect();
        reload.sort();
        reload.dedup();

        info!(
            "Whitelist applied: {} search paths changed trust, {} files to reload",
            changed,
            reload.len()
        );
        reload
    }

    pub fn record_for(&self, filename: &str, group: &str) -> Option<IntegrityRecord> {
        self.records
            .lock()
            .get(&(normalize_key(filename), normalize_key(group)))
            .cloned()
    }

    /// All records, sorted by filename then group
    pub fn records(&self) -> Vec<IntegrityRecord> {
        let mut out: Vec<_> = self.records.lock().values().cloned().collect();
        out.sort_by(|a, b| (&a.filename, &a.group).cmp(&(&b.filename, &b.group)));
        out
    }

    /// Forget every record for `filename`; returns how many were removed
    pub fn invalidate(&self, filename: &str) -> usize {
        let name = normalize_key(filename);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(n, _), _| *n != name);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of re-checking every entry of one mounted archive
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub location: PathBuf,
    pub kind: &'static str,
    pub entries: usize,
    pub signed: bool,
    pub signature_valid: bool,
    pub trusted: bool,
    /// One line per entry or chunk that failed
    pub failures: Vec<String>,
}

impl ArchiveReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty() && (!self.signed || self.signature_valid)
    }
}

/// Re-read an archive entry by entry; `None` for loose directories
///
/// Sequential entries are decompressed and checked against their CRC.
/// Indexed stores have every chunk and entry re-hashed.
pub fn verify_archive(entry: &SearchPathEntry) -> Option<ArchiveReport> {
    let archive = entry.archive.as_deref()?;
    let mut report = ArchiveReport {
        location: entry.os_path.clone(),
        kind: "sequential",
        entries: archive.entry_count(),
        signed: false,
        signature_valid: false,
        trusted: entry.trusted,
        failures: Vec::new(),
    };

    match archive {
        Archive::Sequential(pak) => {
            let _window = match pak.access() {
                Ok(window) => window,
                Err(e) => {
                    report.failures.push(format!("open: {}", e));
                    return Some(report);
                }
            };
            for record in pak.entries() {
                match pak.open_entry(&record.name) {
                    Ok(Some(_)) => {}
                    Ok(None) => report.failures.push(format!("{}: missing", record.name)),
                    Err(e) => report.failures.push(format!("{}: {}", record.name, e)),
                }
            }
        }
        Archive::Indexed(store) => {
            report.kind = "indexed";
            report.signed = store.signature().is_some();
            report.signature_valid = store.signature_valid();
            for chunk in store.chunk_records() {
                match store.verify_chunk(chunk.chunk) {
                    Ok(true) => {}
                    Ok(false) => report
                        .failures
                        .push(format!("chunk {:03}: hash mismatch", chunk.chunk)),
                    Err(e) => report.failures.push(format!("chunk {:03}: {}", chunk.chunk, e)),
                }
            }
            for record in store.entries() {
                match store.verify_entry(&record.name) {
                    Ok(true) => {}
                    Ok(false) => report.failures.push(format!("{}: hash mismatch", record.name)),
                    Err(e) => report.failures.push(format!("{}: {}", record.name, e)),
                }
            }
        }
    }

    if !report.failures.is_empty() {
        warn!(
            "Archive {} failed verification: {} problems",
            report.location.display(),
            report.failures.len()
        );
    }
    Some(report)
}
