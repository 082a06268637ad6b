//! String interning pool

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Strings longer than this are not worth interning
const MAX_LENGTH: usize = 100;

/// Bound on the intern table
const MAX_ENTRIES: usize = 1000;

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringPoolStats {
    pub interned: usize,
    pub interns: u64,
    pub hits: u64,
    pub misses: u64,
    /// Strings skipped for exceeding the length bound
    pub skipped: u64,
}

/// Deduplicates frequently repeated strings
///
/// Work-type names, status labels and session ids repeat constantly;
/// interning them shares one allocation per distinct value.
#[derive(Default)]
pub struct StringPool {
    table: Mutex<HashMap<String, Arc<str>>>,
    interns: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical shared instance of `value`.
    ///
    /// Oversized strings, and new strings once the table is full, are
    /// returned as fresh allocations without being retained.
    pub fn intern(&self, value: &str) -> Arc<str> {
        self.interns.fetch_add(1, Ordering::Relaxed);

        if value.len() > MAX_LENGTH {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Arc::from(value);
        }

        let mut table = self.table.lock();
        if let Some(canonical) = table.get(value) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(canonical);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let canonical: Arc<str> = Arc::from(value);
        if table.len() < MAX_ENTRIES {
            table.insert(value.to_string(), Arc::clone(&canonical));
        }
        canonical
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }

    pub fn stats(&self) -> StringPoolStats {
        StringPoolStats {
            interned: self.len(),
            interns: self.interns.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_shares_allocation() {
        let pool = StringPool::new();

        let a = pool.intern("worker");
        let b = pool.intern("worker");

        assert!(Arc::ptr_eq(&a, &b));
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.interned, 1);
    }

    #[test]
    fn test_long_strings_skipped() {
        let pool = StringPool::new();
        let long = "x".repeat(MAX_LENGTH + 1);

        let a = pool.intern(&long);
        let b = pool.intern(&long);

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.stats().skipped, 2);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_table_is_bounded() {
        let pool = StringPool::new();
        for i in 0..(MAX_ENTRIES + 100) {
            pool.intern(&format!("value-{i}"));
        }
        assert_eq!(pool.len(), MAX_ENTRIES);
    }
}
