//! String interning for directory paths and group tags
//!
//! Every location and group tag in the registry is stored as a [`PathSymbol`]
//! so that comparisons during resolution are integer compares. Strings are
//! case-normalized before interning (backslashes become `/`, ASCII is
//! lower-cased), so `"Assets"` and `"assets"` share one symbol. Directories
//! under a case-sensitive root go through `intern_verbatim` instead. The
//! table only grows.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Interned, case-normalized string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSymbol(u32);

impl PathSymbol {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct Interner {
    lookup: AHashMap<Arc<str>, PathSymbol>,
    strings: Vec<Arc<str>>,
}

/// Append-only symbol table
#[derive(Default)]
pub struct PathTable {
    inner: RwLock<Interner>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the existing symbol if the normalized form is known
    pub fn intern(&self, s: &str) -> PathSymbol {
        self.intern_key(normalize_key(s))
    }

    /// Intern `s` with separators normalized but case preserved
    pub fn intern_verbatim(&self, s: &str) -> PathSymbol {
        self.intern_key(s.replace('\\', "/"))
    }

    fn intern_key(&self, key: String) -> PathSymbol {
        if let Some(sym) = self.inner.read().lookup.get(key.as_str()) {
            return *sym;
        }

        let mut inner = self.inner.write();
        // Another writer may have won between the two locks
        if let Some(sym) = inner.lookup.get(key.as_str()) {
            return *sym;
        }

        let sym = PathSymbol(inner.strings.len() as u32);
        let key: Arc<str> = Arc::from(key);
        inner.strings.push(Arc::clone(&key));
        inner.lookup.insert(key, sym);
        sym
    }

    /// Symbol for `s` if it was interned before
    pub fn get(&self, s: &str) -> Option<PathSymbol> {
        self.inner.read().lookup.get(normalize_key(s).as_str()).copied()
    }

    /// Symbol for a string interned with [`PathTable::intern_verbatim`]
    pub fn get_verbatim(&self, s: &str) -> Option<PathSymbol> {
        self.inner.read().lookup.get(s.replace('\\', "/").as_str()).copied()
    }

    /// Normalized string for a symbol
    ///
    /// # Panics
    ///
    /// Panics if `sym` was produced by a different table.
    pub fn resolve(&self, sym: PathSymbol) -> Arc<str> {
        Arc::clone(&self.inner.read().strings[sym.0 as usize])
    }

    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Case-normalized form used for interning and case-insensitive lookups
pub fn normalize_key(s: &str) -> String {
    s.chars()
        .map(|c| if c == '\\' { '/' } else { c.to_ascii_lowercase() })
        .collect()
}
