//! Filesystem internals
//!
//! Leaves first:
//!
//! - [`symbol`] - interned, case-normalized path strings
//! - [`archive`] - sequential archives and indexed stores
//! - [`registry`] - the ordered search path
//! - [`integrity`] / [`whitelist`] - content hashes and trust policy
//! - [`jobs`] / [`cache`] - background loads into the memory cache
//! - [`resolver`] - name to open handle
//! - [`find`] - merged directory listings
//! - [`context`] - the state all of the above share

pub mod archive;
pub mod cache;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod find;
pub mod handle;
pub mod hash;
pub mod integrity;
pub mod io;
pub mod jobs;
pub mod pattern;
pub mod registry;
pub mod resolver;
pub mod symbol;
pub mod whitelist;

#[cfg(test)]
pub(crate) mod test_support;
