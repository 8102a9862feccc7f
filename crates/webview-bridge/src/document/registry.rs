use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
struct Tables {
    by_uri: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
}

/// Numeric ids for open document URIs.
pub struct DocumentRegistry {
    next_id: AtomicU64,
    tables: Mutex<Tables>,
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Id for `uri`, allocating one on first registration.
    pub fn register(&self, uri: &str) -> u64 {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = tables.by_uri.get(uri) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tables.by_uri.insert(uri.to_string(), id);
        tables.by_id.insert(id, uri.to_string());
        id
    }

    pub fn lookup_id(&self, uri: &str) -> Option<u64> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_uri
            .get(uri)
            .copied()
    }

    pub fn lookup_uri(&self, id: u64) -> Option<String> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    pub fn unregister(&self, uri: &str) -> Option<u64> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let id = tables.by_uri.remove(uri)?;
        tables.by_id.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_uri
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_and_bidirectional() {
        let registry = DocumentRegistry::new();
        let a = registry.register("file:///a.ipynb");
        let b = registry.register("remote:/b.lexical");
        assert_ne!(a, b);
        assert_eq!(registry.register("file:///a.ipynb"), a);
        assert_eq!(registry.lookup_uri(b).as_deref(), Some("remote:/b.lexical"));

        assert_eq!(registry.unregister("file:///a.ipynb"), Some(a));
        assert_eq!(registry.lookup_id("file:///a.ipynb"), None);
        assert_eq!(registry.lookup_uri(a), None);
        assert_eq!(registry.len(), 1);

        // Ids are not reused after unregister.
        assert!(registry.register("file:///a.ipynb") > b);
    }
}
