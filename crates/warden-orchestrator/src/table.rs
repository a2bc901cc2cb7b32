use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// A map of independently locked entries.
///
/// The outer lock is only held long enough to find or insert an entry, so
/// steps touching different keys never wait on each other's mutations.
pub(crate) struct KeyedTable<T> {
    entries: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> KeyedTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the entry for `key`, if present.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.entries.read().get(key).cloned()
    }

    /// Get the entry for `key`, creating it with `init` on first use.
    pub(crate) fn get_or_insert_with(&self, key: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        if let Some(entry) = self.get(key) {
            return entry;
        }
        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    /// Drop the entry for `key`. Holders of its `Arc` keep a detached copy.
    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Snapshot of every `(key, entry)` pair, sorted by key.
    pub(crate) fn entries(&self) -> Vec<(String, Arc<Mutex<T>>)> {
        let mut entries: Vec<(String, Arc<Mutex<T>>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

}

impl<T> Default for KeyedTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys<T>(table: &KeyedTable<T>) -> Vec<String> {
        table.entries().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_lazy_insert_reuses_entry() {
        let table: KeyedTable<u32> = KeyedTable::new();
        let a = table.get_or_insert_with("w1", || 1);
        *a.lock() += 1;
        let b = table.get_or_insert_with("w1", || 100);
        assert_eq!(*b.lock(), 2);
        assert_eq!(keys(&table), vec!["w1".to_string()]);
    }

    #[test]
    fn test_keys_sorted_and_remove() {
        let table: KeyedTable<()> = KeyedTable::new();
        table.get_or_insert_with("b", || ());
        table.get_or_insert_with("a", || ());
        assert_eq!(keys(&table), vec!["a".to_string(), "b".to_string()]);
        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert_eq!(keys(&table), vec!["b".to_string()]);
    }

    #[test]
    fn test_distinct_keys_lock_independently() {
        let table: KeyedTable<u32> = KeyedTable::new();
        let a = table.get_or_insert_with("a", || 0);
        let _guard = a.lock();
        // Holding "a" must not block access to "b".
        let b = table.get_or_insert_with("b", || 7);
        assert_eq!(*b.lock(), 7);
    }
}
