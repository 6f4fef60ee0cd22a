//! Bounded LRU cache of recent redirect chains, keyed by destination URL.
//!
//! Used to backpropagate titles and favicon changes across a redirect chain
//! after the fact. Values are plain URL sequences ending in the key.

use std::num::NonZeroUsize;

use lru::LruCache;

pub struct RedirectCache {
    chains: LruCache<String, Vec<String>>,
}

impl RedirectCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        RedirectCache { chains: LruCache::new(capacity) }
    }

    /// Caches `chain` as the most recent redirect chain ending in
    /// `destination`, evicting the least recently used entry when full.
    pub fn put(&mut self, destination: &str, chain: Vec<String>) {
        self.chains.put(destination.to_string(), chain);
    }

    /// The cached chain ending in `page_url`, or a single-element chain of
    /// just `page_url` on a miss.
    pub fn get(&mut self, page_url: &str) -> Vec<String> {
        match self.chains.get(page_url) {
            Some(chain) => {
                debug_assert_eq!(chain.last().map(String::as_str), Some(page_url));
                chain.clone()
            }
            None => vec![page_url.to_string()],
        }
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_yields_singleton_chain() {
        let mut cache = RedirectCache::new(4);
        assert_eq!(cache.get("https://a.test/"), vec!["https://a.test/".to_string()]);
    }

    #[test]
    fn test_hit_returns_full_chain() {
        let mut cache = RedirectCache::new(4);
        let chain = vec!["http://a.test/".to_string(), "https://a.test/".to_string()];
        cache.put("https://a.test/", chain.clone());
        assert_eq!(cache.get("https://a.test/"), chain);
    }

    #[test]
    fn test_eviction_on_insert() {
        let mut cache = RedirectCache::new(2);
        cache.put("https://a.test/", vec!["https://a.test/".to_string()]);
        cache.put("https://b.test/", vec!["https://b.test/".to_string()]);
        cache.put("https://c.test/", vec!["https://c.test/".to_string()]);
        // "a" was least recently used and fell out; a miss reconstructs a
        // singleton chain.
        assert_eq!(cache.get("https://a.test/"), vec!["https://a.test/".to_string()]);
        assert_eq!(cache.get("https://b.test/"), vec!["https://b.test/".to_string()]);
    }
}
