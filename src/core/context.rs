//! Shared filesystem state
//!
//! One [`FsContext`] holds everything a resolver or enumerator needs. The
//! public [`FileSystem`](crate::FileSystem) wraps it in an `Arc` so background
//! loads can reach it.

use crate::core::cache::MemoryFileCache;
use crate::core::config::FsConfig;
use crate::core::error::Result;
use crate::core::integrity::IntegrityTracker;
use crate::core::registry::SearchPathRegistry;
use crate::core::resolver::FileResolver;
use crate::core::symbol::PathTable;
use crate::core::whitelist::Whitelist;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

pub struct FsContext {
    pub config: Arc<FsConfig>,
    pub paths: Arc<PathTable>,
    pub registry: SearchPathRegistry,
    pub integrity: IntegrityTracker,
    pub cache: MemoryFileCache,
    whitelist: RwLock<Arc<Whitelist>>,
}

impl FsContext {
    pub fn new(config: FsConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let paths = Arc::new(PathTable::new());
        let registry = SearchPathRegistry::new(Arc::clone(&config), Arc::clone(&paths));
        let cache = MemoryFileCache::new(config.worker_threads)?;

        Ok(FsContext {
            config,
            paths,
            registry,
            integrity: IntegrityTracker::new(),
            cache,
            whitelist: RwLock::new(Arc::new(Whitelist::permissive())),
        })
    }

    /// Current whitelist
    pub fn whitelist(&self) -> Arc<Whitelist> {
        Arc::clone(&*self.whitelist.read())
    }

    /// Install a new whitelist and return the files that must be reloaded
    ///
    /// Integrity records of those files are dropped so their next load is
    /// recorded against the new trust state.
    pub fn set_whitelist(&self, whitelist: Whitelist) -> Vec<String> {
        let whitelist = Arc::new(whitelist);
        let reload = {
            let mut current = self.whitelist.write();
            *current = Arc::clone(&whitelist);
            self.integrity.reconcile(&self.registry, &whitelist)
        };
        for name in &reload {
            self.integrity.invalidate(name);
        }
        info!(
            "Installed whitelist with {} trusted keys",
            whitelist.trusted_key_count()
        );
        reload
    }

    /// Re-evaluate the trusted flag of every search path entry
    ///
    /// The read lock is held across the update so a concurrent
    /// [`set_whitelist`](Self::set_whitelist) cannot be overwritten with
    /// verdicts from the whitelist it replaced.
    pub fn refresh_trust(&self) -> usize {
        let whitelist = self.whitelist.read();
        self.registry
            .update_trust(|e| IntegrityTracker::evaluate_trust(e, &whitelist))
    }

    pub fn resolver(&self) -> FileResolver<'_> {
        FileResolver::new(self)
    }
}

impl std::fmt::Debug for FsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContext")
            .field("search_paths", &self.registry.len())
            .field("interned", &self.paths.len())
            .field("records", &self.integrity.len())
            .finish()
    }
}
