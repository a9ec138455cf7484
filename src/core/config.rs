//! Filesystem configuration
//!
//! Loaded from TOML or built in code. Every field has a default so a config
//! file only needs to name what it changes:
//!
//! ```toml
//! base_dir = "/srv/game"
//! default_write_group = "user_data"
//! worker_threads = 4
//! ```

use crate::core::archive::ArchiveKind;
use crate::core::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Directory that relative search paths are resolved against
    pub base_dir: PathBuf,

    /// Loose directories under this root keep their case; everything else
    /// is lower-cased when registered
    pub case_sensitive_root: Option<PathBuf>,

    /// Group used for writes when neither `<group>_write` nor `<group>` has
    /// a writable entry
    pub default_write_group: String,

    /// Suffixes mounted as sequential archives
    pub sequential_extensions: Vec<String>,

    /// Suffixes mounted as indexed stores (the index file)
    pub indexed_extensions: Vec<String>,

    /// Host containers whose embedded archives are map-embedded
    pub map_extensions: Vec<String>,

    /// Background read workers for prefetch
    pub worker_threads: usize,

    /// Record a content hash for every file loaded from disk or archive
    pub track_integrity: bool,

    /// Upper bound on a single decompressed archive entry
    pub max_entry_size: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            case_sensitive_root: None,
            default_write_group: "default_write_path".to_string(),
            sequential_extensions: vec!["pak".to_string()],
            indexed_extensions: vec!["idx".to_string()],
            map_extensions: vec!["bsp".to_string(), "map".to_string()],
            worker_threads: 2,
            track_integrity: true,
            max_entry_size: 256 * 1024 * 1024,
        }
    }
}

impl FsConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: FsConfig = toml::from_str(s).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(FsError::Config("worker_threads must be at least 1".to_string()));
        }
        if self.default_write_group.is_empty() {
            return Err(FsError::Config(
                "default_write_group cannot be empty".to_string(),
            ));
        }
        if self.max_entry_size == 0 {
            return Err(FsError::Config("max_entry_size must be non-zero".to_string()));
        }
        for ext in self.sequential_extensions.iter() {
            if self.indexed_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                return Err(FsError::Config(format!(
                    "extension '{}' is listed as both sequential and indexed",
                    ext
                )));
            }
        }
        Ok(())
    }

    /// Archive format implied by the location's suffix, if any
    pub fn archive_kind_for(&self, location: &Path) -> Option<ArchiveKind> {
        let ext = location.extension()?.to_str()?;
        if has_ext(&self.sequential_extensions, ext) {
            Some(ArchiveKind::Sequential)
        } else if has_ext(&self.indexed_extensions, ext) {
            Some(ArchiveKind::Indexed)
        } else {
            None
        }
    }

    pub fn is_map_host(&self, host: &Path) -> bool {
        host.extension()
            .and_then(|e| e.to_str())
            .map(|e| has_ext(&self.map_extensions, e))
            .unwrap_or(false)
    }

    /// Whether a normalized absolute directory keeps its case
    pub fn is_case_sensitive(&self, dir: &Path) -> bool {
        match &self.case_sensitive_root {
            Some(root) => dir.starts_with(root),
            None => false,
        }
    }
}

fn has_ext(list: &[String], ext: &str) -> bool {
    list.iter().any(|e| e.eq_ignore_ascii_case(ext))
}
