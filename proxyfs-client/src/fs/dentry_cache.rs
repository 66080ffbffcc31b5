// Copyright 2025 OPPO.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lru::LruCache;
use proxyfs_common::proto::Dentry;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    dentry: Dentry,
    expires_at: Instant,
}

/// Bounded path -> attributes cache with TTL. Capacity 0 disables it and
/// every operation becomes a no-op, which keeps the invalidation call
/// sites unconditional.
pub struct DentryCache {
    inner: Option<Mutex<LruCache<String, CacheEntry>>>,
    ttl: Duration,
}

impl DentryCache {
    pub fn new(capacity: usize, expire_ms: u64) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            inner,
            ttl: Duration::from_millis(expire_ms),
        }
    }

    pub fn put(&self, path: &str, dentry: Dentry) {
        let Some(inner) = &self.inner else {
            return;
        };

        let entry = CacheEntry {
            dentry,
            expires_at: Instant::now() + self.ttl,
        };
        inner.lock().unwrap().put(path.to_string(), entry);
    }

    /// Expired entries read as absent and are dropped on the spot.
    pub fn get(&self, path: &str) -> Option<Dentry> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock().unwrap();

        match cache.get(path) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.dentry.clone()),
            Some(_) => {
                cache.pop(path);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, path: &str) {
        if let Some(inner) = &self.inner {
            inner.lock().unwrap().pop(path);
        }
    }

    /// Drops every entry whose path starts with `prefix`; used by rename
    /// and recursive removal.
    pub fn remove_prefix(&self, prefix: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        let mut cache = inner.lock().unwrap();
        let keys: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.lock().unwrap().len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dentry(name: &str, ino: u64) -> Dentry {
        Dentry {
            name: name.to_string(),
            inode: ino,
            dtype: 1,
            info: None,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let cache = DentryCache::new(16, 60_000);
        cache.put("/a/b", dentry("b", 1));
        assert_eq!(cache.get("/a/b").unwrap().inode, 1);

        cache.remove("/a/b");
        assert!(cache.get("/a/b").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = DentryCache::new(16, 0);
        cache.put("/a", dentry("a", 1));
        // zero TTL expires immediately
        assert!(cache.get("/a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = DentryCache::new(2, 60_000);
        cache.put("/a", dentry("a", 1));
        cache.put("/b", dentry("b", 2));
        cache.put("/c", dentry("c", 3));
        assert_eq!(cache.len(), 2);
        // the oldest entry was evicted
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/c").is_some());
    }

    #[test]
    fn test_remove_prefix() {
        let cache = DentryCache::new(16, 60_000);
        cache.put("/dir", dentry("dir", 1));
        cache.put("/dir/x", dentry("x", 2));
        cache.put("/dir/y", dentry("y", 3));
        cache.put("/dirother", dentry("dirother", 4));
        cache.put("/other", dentry("other", 5));

        cache.remove_prefix("/dir");

        assert!(cache.get("/dir").is_none());
        assert!(cache.get("/dir/x").is_none());
        assert!(cache.get("/dir/y").is_none());
        // plain string prefix match also takes cousins sharing the prefix
        assert!(cache.get("/dirother").is_none());
        assert!(cache.get("/other").is_some());
    }

    #[test]
    fn test_disabled_cache() {
        let cache = DentryCache::new(0, 60_000);
        cache.put("/a", dentry("a", 1));
        assert!(cache.get("/a").is_none());
        cache.remove("/a");
        cache.remove_prefix("/");
        assert!(cache.is_empty());
    }
}
