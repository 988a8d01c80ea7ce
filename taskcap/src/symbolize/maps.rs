//! /proc/<pid>/maps parsing for PIE load-bias adjustment.

use anyhow::{Context, Result};
use std::fs;

/// Memory range of a loaded binary in a process's address space.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Find the full mapped range of `binary_path` inside process `pid`.
///
/// # Errors
/// Returns an error if the maps file cannot be read or the binary has no
/// mapping (process execed away or exited).
pub fn exe_memory_range(pid: u32, binary_path: &str) -> Result<MemoryRange> {
    let maps_path = format!("/proc/{pid}/maps");
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
    parse_maps(&maps, binary_path)
        .ok_or_else(|| anyhow::anyhow!("No mapping of {binary_path} in pid {pid}"))
}

/// Scan maps-formatted text for all mappings of `binary_path` and return
/// the min-start/max-end envelope.
#[must_use]
pub fn parse_maps(maps: &str, binary_path: &str) -> Option<MemoryRange> {
    let mut start_addr: Option<u64> = None;
    let mut end_addr: Option<u64> = None;

    for line in maps.lines() {
        if !line.ends_with(binary_path) {
            continue;
        }
        let range = line.split_whitespace().next()?;
        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        start_addr = Some(start_addr.map_or(start, |s| s.min(start)));
        end_addr = Some(end_addr.map_or(end, |e| e.max(end)));
    }

    match (start_addr, end_addr) {
        (Some(start), Some(end)) => Some(MemoryRange { start, end }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d2f9000000-55d2f9100000 r--p 00000000 fd:01 123 /usr/bin/postgres
55d2f9100000-55d2f9600000 r-xp 00100000 fd:01 123 /usr/bin/postgres
55d2f9600000-55d2f9700000 rw-p 00600000 fd:01 123 /usr/bin/postgres
7f0000000000-7f0000200000 r-xp 00000000 fd:01 456 /usr/lib/libc.so.6
";

    #[test]
    fn envelope_covers_all_segments() {
        let range = parse_maps(MAPS, "/usr/bin/postgres").unwrap();
        assert_eq!(range.start, 0x55d2_f900_0000);
        assert_eq!(range.end, 0x55d2_f970_0000);
        assert!(range.contains(0x55d2_f912_3456));
        assert!(!range.contains(0x7f00_0000_1000));
    }

    #[test]
    fn missing_binary_yields_none() {
        assert!(parse_maps(MAPS, "/usr/bin/mysql").is_none());
    }

    #[test]
    fn own_process_has_exe_mapping() {
        let pid = std::process::id();
        let exe = std::env::current_exe().unwrap();
        let range = exe_memory_range(pid, exe.to_str().unwrap());
        assert!(range.is_ok());
    }
}
