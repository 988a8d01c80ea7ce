//! Cgroup-v2 path resolution.
//!
//! The kernel half reports only the cgroup id. On first sighting of an id
//! we read `/proc/<tid>/cgroup` of the task that carried it and memoize
//! the `0::` line. A task can exit between the sample and the read; the
//! id then stays unresolved and the next sighting retries with another
//! tid of the same id.

use std::fs;

use crate::caches::BoundedCache;

pub struct CgroupCache {
    resolved: BoundedCache<u64, String>,
}

impl Default for CgroupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupCache {
    #[must_use]
    pub fn new() -> Self {
        Self { resolved: BoundedCache::new(4096) }
    }

    /// Note a `(cgroup_id, tid)` sighting. Returns the resolved path only
    /// when this sighting resolved a previously unknown id, so the caller
    /// emits exactly one cgroup record per id.
    pub fn observe(&mut self, cgroup_id: u64, tid: u32) -> Option<String> {
        if cgroup_id == 0 || self.resolved.contains(&cgroup_id) {
            return None;
        }
        let content = fs::read_to_string(format!("/proc/{tid}/cgroup")).ok()?;
        let path = parse_v2_path(&content)?;
        self.resolved.insert(cgroup_id, path.clone());
        Some(path)
    }

    #[must_use]
    pub fn path_of(&self, cgroup_id: u64) -> Option<&str> {
        self.resolved.get(&cgroup_id).map(String::as_str)
    }
}

/// Extract the cgroup-v2 path: the line starting with `0::`, prefix and
/// trailing newline stripped.
#[must_use]
pub fn parse_v2_path(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v2_line() {
        let content = "0::/system.slice/postgresql.service\n";
        assert_eq!(parse_v2_path(content), Some("/system.slice/postgresql.service".to_string()));
    }

    #[test]
    fn skips_v1_controllers() {
        let content = "12:pids:/user.slice\n1:name=systemd:/init.scope\n0::/user.slice/run.scope\n";
        assert_eq!(parse_v2_path(content), Some("/user.slice/run.scope".to_string()));
    }

    #[test]
    fn no_v2_line_resolves_nothing() {
        assert_eq!(parse_v2_path("12:pids:/user.slice\n"), None);
        assert_eq!(parse_v2_path(""), None);
    }

    #[test]
    fn observe_own_process_resolves_once() {
        let mut cache = CgroupCache::new();
        let tid = std::process::id();
        // Any non-zero id; the path comes from our own /proc entry
        let first = cache.observe(42, tid);
        if first.is_some() {
            // second sighting of the same id is silent
            assert!(cache.observe(42, tid).is_none());
            assert!(cache.path_of(42).is_some());
        }
    }

    #[test]
    fn observe_zero_id_is_ignored() {
        let mut cache = CgroupCache::new();
        assert!(cache.observe(0, std::process::id()).is_none());
    }

    #[test]
    fn observe_dead_task_leaves_unresolved() {
        let mut cache = CgroupCache::new();
        // tid that cannot exist
        assert!(cache.observe(7, 4_100_000_000).is_none());
        assert!(cache.path_of(7).is_none());
    }
}
