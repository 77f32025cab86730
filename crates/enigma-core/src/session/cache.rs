//! Live API objects keyed by handle, with their delta patchees.

use crate::error::{EnigmaError, Result};
use crate::schema::Api;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

struct CacheEntry {
    api: Arc<Api>,
    /// Last full value per `<method>-<out key>`, for the delta protocol.
    patchees: HashMap<String, Value>,
}

/// Handle → API registry.
#[derive(Default)]
pub struct ApiCache {
    entries: HashMap<i64, CacheEntry>,
}

impl ApiCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: i64, api: Arc<Api>) -> Result<()> {
        if self.entries.contains_key(&handle) {
            return Err(EnigmaError::EntryAlreadyDefined { handle });
        }
        self.entries.insert(
            handle,
            CacheEntry {
                api,
                patchees: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, handle: i64) -> Option<Arc<Api>> {
        self.entries.get(&handle).map(|entry| entry.api.clone())
    }

    pub fn remove(&mut self, handle: i64) -> Option<Arc<Api>> {
        self.entries.remove(&handle).map(|entry| entry.api)
    }

    /// Every cached API, ordered by handle.
    pub fn apis(&self) -> Vec<Arc<Api>> {
        let mut handles: Vec<&i64> = self.entries.keys().collect();
        handles.sort_unstable();
        handles
            .into_iter()
            .filter_map(|h| self.entries.get(h).map(|entry| entry.api.clone()))
            .collect()
    }

    /// Empty the cache, returning what it held (ordered by handle).
    pub fn clear(&mut self) -> Vec<Arc<Api>> {
        let apis = self.apis();
        self.entries.clear();
        apis
    }

    /// Replace the contents with `apis`, keyed by the given handles.
    ///
    /// Patchees are dropped: the restored objects start a fresh delta stream.
    /// On a duplicate handle the cache is left as it was.
    pub fn replace(&mut self, apis: Vec<(i64, Arc<Api>)>) -> Result<()> {
        let mut entries = HashMap::with_capacity(apis.len());
        for (handle, api) in apis {
            if entries.contains_key(&handle) {
                return Err(EnigmaError::EntryAlreadyDefined { handle });
            }
            entries.insert(
                handle,
                CacheEntry {
                    api,
                    patchees: HashMap::new(),
                },
            );
        }
        self.entries = entries;
        Ok(())
    }

    pub fn get_patchee(&self, handle: i64, key: &str) -> Option<Value> {
        self.entries
            .get(&handle)
            .and_then(|entry| entry.patchees.get(key).cloned())
    }

    /// Store a patchee. Returns false when no API is cached for `handle`.
    pub fn set_patchee(&mut self, handle: i64, key: &str, value: Value) -> bool {
        match self.entries.get_mut(&handle) {
            Some(entry) => {
                entry.patchees.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ApiCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handles: Vec<&i64> = self.entries.keys().collect();
        handles.sort_unstable();
        f.debug_struct("ApiCache").field("handles", &handles).finish()
    }
}
