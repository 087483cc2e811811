//! Name hashing
//!
//! Regions are identified by the FNV-1a hash of their label. Each thread keeps
//! its own hash → label table while running; at finalize all tables are
//! imported into one so every hash is resolvable no matter which thread
//! produced it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hasher;

/// Hash a region label using FNV-1a
///
/// # Example
/// ```
/// use critrace::hash_table::hash_name;
///
/// assert_eq!(hash_name("main"), hash_name("main"));
/// assert_ne!(hash_name("main"), hash_name("worker"));
/// ```
pub fn hash_name(name: &str) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Map from label hash to label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTable {
    entries: HashMap<u64, String>,
}

impl HashTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `name`, remember it, and return the hash
    pub fn intern(&mut self, name: &str) -> u64 {
        let hash = hash_name(name);
        self.entries
            .entry(hash)
            .or_insert_with(|| name.to_string());
        hash
    }

    pub fn insert(&mut self, hash: u64, name: impl Into<String>) {
        self.entries.insert(hash, name.into());
    }

    pub fn get(&self, hash: u64) -> Option<&str> {
        self.entries.get(&hash).map(String::as_str)
    }

    /// Import every entry of `other`; on duplicate keys the imported entry wins
    pub fn import(&mut self, other: &HashTable) {
        for (hash, name) in &other.entries {
            self.entries.insert(*hash, name.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.entries.iter().map(|(h, n)| (*h, n.as_str()))
    }
}
