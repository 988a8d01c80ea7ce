//! Bounded in-process caches.
//!
//! Every cache in the output path is bounded: the sampler runs for weeks
//! and uid/cgroup/stack churn must not grow memory without limit. On
//! overflow an arbitrary entry is evicted; a re-resolve after eviction is
//! harmless for all three users.

use std::collections::HashMap;
use std::ffi::CStr;
use std::hash::Hash;

/// HashMap with a capacity ceiling.
pub struct BoundedCache<K, V> {
    map: HashMap<K, V>,
    cap: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { map: HashMap::new(), cap: cap.max(1) }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.map.len() >= self.cap && !self.map.contains_key(&key) {
            if let Some(victim) = self.map.keys().next().cloned() {
                self.map.remove(&victim);
            }
        }
        self.map.insert(key, value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// uid -> username, via getpwuid_r. Unresolvable uids render as the
/// numeric value so the column is never empty.
pub struct UsernameCache {
    cache: BoundedCache<u32, String>,
}

impl Default for UsernameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl UsernameCache {
    #[must_use]
    pub fn new() -> Self {
        Self { cache: BoundedCache::new(1024) }
    }

    pub fn lookup(&mut self, uid: u32) -> String {
        if let Some(name) = self.cache.get(&uid) {
            return name.clone();
        }
        let name = resolve_username(uid).unwrap_or_else(|| uid.to_string());
        self.cache.insert(uid, name.clone());
        name
    }
}

#[allow(unsafe_code)]
fn resolve_username(uid: u32) -> Option<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = [0u8; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: getpwuid_r writes pw_name into buf, which outlives the CStr read below
    let rc = unsafe {
        libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    // SAFETY: on success pw_name points at a NUL-terminated string inside buf
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_cache_evicts_at_cap() {
        let mut c = BoundedCache::new(4);
        for i in 0..10u32 {
            c.insert(i, i * 2);
        }
        assert_eq!(c.len(), 4);
        // the last insert always survives
        assert_eq!(c.get(&9), Some(&18));
    }

    #[test]
    fn bounded_cache_update_does_not_evict() {
        let mut c = BoundedCache::new(2);
        c.insert("a", 1);
        c.insert("b", 2);
        c.insert("a", 3); // update in place
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"a"), Some(&3));
        assert_eq!(c.get(&"b"), Some(&2));
    }

    #[test]
    fn username_lookup_root() {
        let mut users = UsernameCache::new();
        // uid 0 exists on any Linux system this runs on
        assert_eq!(users.lookup(0), "root");
        // second lookup hits the cache
        assert_eq!(users.lookup(0), "root");
    }

    #[test]
    fn username_lookup_unknown_uid_falls_back_to_number() {
        let mut users = UsernameCache::new();
        assert_eq!(users.lookup(4_000_000_000), "4000000000");
    }
}
