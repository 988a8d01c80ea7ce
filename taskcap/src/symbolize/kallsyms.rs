//! Kernel symbol resolution from /proc/kallsyms.
//!
//! The table is loaded once at startup and binary-searched per frame.
//! Under kptr_restrict the addresses all read as zero; resolution then
//! yields hex frames, which is the documented degraded mode.

use anyhow::{Context, Result};
use std::fs;

pub struct KernelSymbols {
    /// (address, name), sorted by address.
    syms: Vec<(u64, String)>,
}

impl KernelSymbols {
    /// Load the live kernel's symbol table.
    ///
    /// # Errors
    /// Returns an error if /proc/kallsyms cannot be read.
    pub fn load() -> Result<Self> {
        let content =
            fs::read_to_string("/proc/kallsyms").context("Failed to read /proc/kallsyms")?;
        Ok(Self::parse(&content))
    }

    /// Parse kallsyms-formatted text: `<addr> <type> <name> [module]`.
    /// Only text symbols are kept.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut syms: Vec<(u64, String)> = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let kind = parts.next()?;
                let name = parts.next()?;
                if addr == 0 || !matches!(kind, "t" | "T" | "w" | "W") {
                    return None;
                }
                Some((addr, name.to_string()))
            })
            .collect();
        syms.sort_unstable_by_key(|(addr, _)| *addr);
        syms.dedup_by_key(|(addr, _)| *addr);
        Self { syms }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Resolve an address to `(symbol, offset)` of the nearest preceding
    /// text symbol.
    #[must_use]
    pub fn resolve(&self, addr: u64) -> Option<(&str, u64)> {
        let idx = match self.syms.binary_search_by_key(&addr, |(a, _)| *a) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (base, name) = &self.syms[idx];
        Some((name.as_str(), addr - base))
    }

    /// `function+0xoffset` token, or bare hex when unresolvable.
    #[must_use]
    pub fn format_frame(&self, addr: u64) -> String {
        match self.resolve(addr) {
            Some((name, off)) => format!("{name}+0x{off:x}"),
            None => format!("0x{addr:x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ffffffff81000000 T _stext
ffffffff81001000 T vfs_read
ffffffff81002000 t vfs_write_iter
ffffffff81003000 D some_data
0000000000000000 T hidden_by_kptr_restrict
";

    #[test]
    fn resolves_within_symbol() {
        let syms = KernelSymbols::parse(SAMPLE);
        assert_eq!(syms.resolve(0xffff_ffff_8100_1080), Some(("vfs_read", 0x80)));
        assert_eq!(syms.format_frame(0xffff_ffff_8100_1080), "vfs_read+0x80");
    }

    #[test]
    fn exact_address_has_zero_offset() {
        let syms = KernelSymbols::parse(SAMPLE);
        assert_eq!(syms.format_frame(0xffff_ffff_8100_2000), "vfs_write_iter+0x0");
    }

    #[test]
    fn data_symbols_are_skipped() {
        let syms = KernelSymbols::parse(SAMPLE);
        // 0x3000 falls after vfs_write_iter, not inside some_data
        assert_eq!(syms.resolve(0xffff_ffff_8100_3080).unwrap().0, "vfs_write_iter");
    }

    #[test]
    fn below_first_symbol_is_hex() {
        let syms = KernelSymbols::parse(SAMPLE);
        assert_eq!(syms.format_frame(0x1000), "0x1000");
    }

    #[test]
    fn restricted_table_is_empty() {
        let syms = KernelSymbols::parse("0000000000000000 T stext\n0000000000000000 T foo\n");
        assert!(syms.is_empty());
    }
}
