use std::collections::HashMap;
use std::fmt::{Debug, Write};
use std::hash::Hash;

use crate::error::{PagingError, Result};

/// Associative map whose misses are protocol errors.
///
/// The residency tables never field speculative queries: by the time the
/// dispatcher looks a key up, the protocol guarantees it is present, and a
/// miss means a lost message or a double-free. Lookup and removal therefore
/// return an error carrying a rendered dump of the whole table instead of a
/// recoverable `None`.
#[derive(Debug)]
pub struct StrictMap<K, V> {
    name: &'static str,
    entries: HashMap<K, V>,
}

impl<K, V> StrictMap<K, V>
where
    K: Copy + Eq + Hash + Debug,
    V: Debug,
{
    pub fn new(name: &'static str) -> StrictMap<K, V> {
        StrictMap {
            name,
            entries: HashMap::new(),
        }
    }

    /// Insert a fresh binding. Rebinding an existing key is a protocol error.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(self.fail_duplicate(key));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: K) -> Result<&V> {
        self.entries.get(&key).ok_or_else(|| self.fail_missing(key))
    }

    pub fn get_mut(&mut self, key: K) -> Result<&mut V> {
        if !self.entries.contains_key(&key) {
            return Err(self.fail_missing(key));
        }
        Ok(self.entries.get_mut(&key).unwrap())
    }

    /// Non-strict probe for the callers that genuinely may miss
    /// (synonym scans, flush filters).
    #[inline]
    pub fn probe(&self, key: K) -> Option<&V> {
        self.entries.get(&key)
    }

    #[inline]
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn remove(&mut self, key: K) -> Result<V> {
        self.entries
            .remove(&key)
            .ok_or_else(|| self.fail_missing(key))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Render every binding, one per line, for the fatal diagnostics path.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} ({} entries):", self.name, self.entries.len());
        for (key, value) in &self.entries {
            let _ = writeln!(out, "  {key:?} -> {value:?}");
        }
        out
    }

    fn fail_missing(&self, key: K) -> PagingError {
        let dump = self.dump();
        log::error!("{}: missing key {key:?}\n{dump}", self.name);
        PagingError::MissingKey {
            table: self.name,
            key: format!("{key:?}"),
            dump,
        }
    }

    fn fail_duplicate(&self, key: K) -> PagingError {
        let dump = self.dump();
        log::error!("{}: duplicate key {key:?}\n{dump}", self.name);
        PagingError::DuplicateKey {
            table: self.name,
            key: format!("{key:?}"),
            dump,
        }
    }
}
