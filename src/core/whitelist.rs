//! Trust policy: trusted signer keys and per-file integrity classes
//!
//! ```toml
//! default_class = "any"
//! trusted_keys = ["8a88e3dd7409f195fd52db2d3cba5d72ca6709bf1d94121bf3748801b40f6f5c"]
//!
//! [[rules]]
//! pattern = "cfg/**"
//! class = "trusted_only"
//! ```

use crate::core::error::{FsError, Result};
use crate::core::pattern::PatternMatcher;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which sources a file may be loaded from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityClass {
    /// Any search path
    #[default]
    Any,
    /// Only entries whose source is trusted
    TrustedOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRule {
    pub pattern: String,
    pub class: IntegrityClass,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WhitelistFile {
    default_class: IntegrityClass,
    trusted_keys: Vec<String>,
    rules: Vec<IntegrityRule>,
}

/// Active trust policy
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    trusted_keys: AHashSet<[u8; 32]>,
    rules: Vec<IntegrityRule>,
    default_class: IntegrityClass,
}

impl Whitelist {
    /// No trusted keys, every file loadable from anywhere
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn trust_key(mut self, key: [u8; 32]) -> Self {
        self.trusted_keys.insert(key);
        self
    }

    /// Add a rule; earlier rules take precedence
    pub fn with_rule(mut self, pattern: impl Into<String>, class: IntegrityClass) -> Self {
        self.rules.push(IntegrityRule {
            pattern: pattern.into(),
            class,
        });
        self
    }

    pub fn with_default_class(mut self, class: IntegrityClass) -> Self {
        self.default_class = class;
        self
    }

    pub fn trusts_key(&self, key: &[u8; 32]) -> bool {
        self.trusted_keys.contains(key)
    }

    pub fn trusted_key_count(&self) -> usize {
        self.trusted_keys.len()
    }

    /// Integrity class of a logical file name
    pub fn class_for(&self, name: &str) -> IntegrityClass {
        self.rules
            .iter()
            .find(|rule| PatternMatcher::matches(&rule.pattern, name))
            .map(|rule| rule.class)
            .unwrap_or(self.default_class)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: WhitelistFile = toml::from_str(s).map_err(|e| FsError::Config(e.to_string()))?;
        let mut whitelist = Whitelist {
            trusted_keys: AHashSet::with_capacity(file.trusted_keys.len()),
            rules: file.rules,
            default_class: file.default_class,
        };
        for key in &file.trusted_keys {
            whitelist.trusted_keys.insert(parse_key(key)?);
        }
        Ok(whitelist)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Decode a hex-encoded 32-byte public key
pub fn parse_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| FsError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| FsError::InvalidKey(format!("expected 32 bytes: {}", hex_key)))
}
