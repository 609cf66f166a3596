//! Named cache generations kept in the local store.
//!
//! Entries live under `cache:<generation>:<METHOD> <url>`. Generation names
//! must not contain `:`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::{get_json, set_json, LocalStore};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse};

const CACHE_PREFIX: &str = "cache:";

/// Request identity used as the cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub method: HttpMethod,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }

    pub fn of(request: &HttpRequest) -> Self {
        Self::new(request.method, request.url.clone())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[derive(Clone)]
pub struct CacheStorage {
    store: Arc<dyn LocalStore>,
}

impl CacheStorage {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    fn entry_key(generation: &str, key: &RequestKey) -> String {
        format!("{CACHE_PREFIX}{generation}:{key}")
    }

    fn generation_prefix(generation: &str) -> String {
        format!("{CACHE_PREFIX}{generation}:")
    }

    /// Overwrites any previous entry for the same identity.
    pub fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        response: &HttpResponse,
    ) -> Result<(), StoreError> {
        set_json(self.store.as_ref(), &Self::entry_key(generation, key), response)
    }

    pub fn match_in(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<HttpResponse>, StoreError> {
        get_json(self.store.as_ref(), &Self::entry_key(generation, key))
    }

    /// First hit across all generations, in name order.
    pub fn match_any(&self, key: &RequestKey) -> Result<Option<HttpResponse>, StoreError> {
        for generation in self.generations()? {
            if let Some(hit) = self.match_in(&generation, key)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    pub fn generations(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .store
            .keys_with_prefix(CACHE_PREFIX)?
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(CACHE_PREFIX)?;
                rest.split_once(':').map(|(generation, _)| generation.to_string())
            })
            .collect())
    }

    pub fn entry_count(&self, generation: &str) -> Result<usize, StoreError> {
        Ok(self.store.keys_with_prefix(&Self::generation_prefix(generation))?.len())
    }

    /// Returns the number of entries removed.
    pub fn delete_generation(&self, generation: &str) -> Result<usize, StoreError> {
        let keys = self.store.keys_with_prefix(&Self::generation_prefix(generation))?;
        for key in &keys {
            self.store.remove(key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn put_overwrites_and_generations_are_isolated() {
        let caches = CacheStorage::new(Arc::new(MemoryStore::new()));
        let key = RequestKey::new(HttpMethod::Get, "https://api.city.example/Reports");

        caches.put("api-v1", &key, &HttpResponse::text(200, "old")).expect("put");
        caches.put("api-v2", &key, &HttpResponse::text(200, "v2")).expect("put");
        caches.put("api-v1", &key, &HttpResponse::text(200, "new")).expect("put");

        let hit = caches.match_in("api-v1", &key).expect("match");
        assert_eq!(hit.map(|r| r.body), Some("new".into()));
        assert_eq!(
            caches.generations().expect("generations").into_iter().collect::<Vec<_>>(),
            vec!["api-v1".to_string(), "api-v2".to_string()]
        );

        assert_eq!(caches.delete_generation("api-v1").expect("delete"), 1);
        assert_eq!(caches.match_in("api-v1", &key).expect("match"), None);
        assert_eq!(caches.match_any(&key).expect("match").map(|r| r.body), Some("v2".into()));
    }

    #[test]
    fn method_is_part_of_identity() {
        let caches = CacheStorage::new(Arc::new(MemoryStore::new()));
        let get = RequestKey::new(HttpMethod::Get, "/x");
        let post = RequestKey::new(HttpMethod::Post, "/x");
        caches.put("g", &get, &HttpResponse::text(200, "get")).expect("put");
        assert_eq!(caches.match_in("g", &post).expect("match"), None);
        assert_eq!(caches.entry_count("g").expect("count"), 1);
    }
}
