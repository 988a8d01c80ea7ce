//! User-space frame resolution.
//!
//! Frames are resolved against the ELF symbol table of the owning
//! process's executable (`/proc/<tid>/exe`), with the PIE load bias
//! subtracted first. Symbol tables are parsed once per executable path
//! and shared across the processes running it; load ranges are cached
//! per task. Shared-library frames and stripped binaries fall back to
//! hex tokens.

use anyhow::{Context, Result};
use object::{Object, ObjectSymbol};
use rustc_demangle::demangle;
use std::fs;
use std::rc::Rc;

use crate::caches::BoundedCache;
use crate::symbolize::maps::{exe_memory_range, MemoryRange};

/// Sorted function-symbol table of one executable.
pub struct ExeSymbols {
    /// (address, size, demangled name), sorted by address.
    syms: Vec<(u64, u64, String)>,
}

impl ExeSymbols {
    /// Parse the symbol table of an ELF binary.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed as ELF.
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read(path).context(format!("Failed to read {path}"))?;
        let obj = object::File::parse(&*data).context("Failed to parse object file")?;

        let mut syms: Vec<(u64, u64, String)> = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .filter(|sym| sym.kind() == object::SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                Some((sym.address(), sym.size(), format!("{:#}", demangle(name))))
            })
            .collect();
        syms.sort_unstable_by_key(|(addr, _, _)| *addr);
        syms.dedup_by_key(|(addr, _, _)| *addr);
        Ok(Self { syms })
    }

    /// Resolve a virtual address to `(name, offset)`.
    #[must_use]
    pub fn resolve(&self, vaddr: u64) -> Option<(&str, u64)> {
        let idx = match self.syms.binary_search_by_key(&vaddr, |(a, _, _)| *a) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (base, size, name) = &self.syms[idx];
        let off = vaddr - base;
        // Zero-size symbols (assembly stubs) accept any following address
        if *size > 0 && off >= *size {
            return None;
        }
        Some((name.as_str(), off))
    }
}

pub struct UserSymbolizer {
    /// exe path -> parsed symbols (None after a failed parse, so stripped
    /// binaries are not re-read every tick)
    tables: BoundedCache<String, Option<Rc<ExeSymbols>>>,
    /// tid -> (exe path, load range)
    ranges: BoundedCache<u32, Option<(String, MemoryRange)>>,
}

impl Default for UserSymbolizer {
    fn default() -> Self {
        Self::new()
    }
}

impl UserSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self { tables: BoundedCache::new(256), ranges: BoundedCache::new(4096) }
    }

    /// Format one stack as `function+0xoffset` tokens, hex where
    /// unresolvable.
    pub fn format_stack(&mut self, tid: u32, addrs: &[u64]) -> Vec<String> {
        let located = self.locate(tid);
        addrs
            .iter()
            .map(|&addr| match &located {
                Some((table, range)) if range.contains(addr) => {
                    match table.resolve(addr - range.start) {
                        Some((name, off)) => format!("{name}+0x{off:x}"),
                        None => format!("0x{addr:x}"),
                    }
                }
                _ => format!("0x{addr:x}"),
            })
            .collect()
    }

    fn locate(&mut self, tid: u32) -> Option<(Rc<ExeSymbols>, MemoryRange)> {
        if !self.ranges.contains(&tid) {
            let located = read_exe_range(tid);
            self.ranges.insert(tid, located);
        }
        let (path, range) = self.ranges.get(&tid)?.clone()?;

        if !self.tables.contains(&path) {
            let table = ExeSymbols::load(&path).ok().map(Rc::new);
            if table.is_none() {
                log::debug!("no symbol table for {path}");
            }
            self.tables.insert(path.clone(), table);
        }
        let table = self.tables.get(&path)?.clone()?;
        Some((table, range))
    }
}

fn read_exe_range(tid: u32) -> Option<(String, MemoryRange)> {
    let exe = fs::read_link(format!("/proc/{tid}/exe")).ok()?;
    let path = exe.to_str()?.to_string();
    let range = exe_memory_range(tid, &path).ok()?;
    Some((path, range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_own_symbols() {
        let exe = std::env::current_exe().unwrap();
        let table = ExeSymbols::load(exe.to_str().unwrap()).unwrap();
        assert!(!table.syms.is_empty(), "test binary should have a symbol table");
        // resolving the address of a known symbol hits that symbol
        let (addr, _, name) = table.syms[table.syms.len() / 2].clone();
        let (resolved, off) = table.resolve(addr).unwrap();
        assert_eq!(resolved, name);
        assert_eq!(off, 0);
    }

    #[test]
    fn below_first_symbol_is_none() {
        let exe = std::env::current_exe().unwrap();
        let table = ExeSymbols::load(exe.to_str().unwrap()).unwrap();
        assert!(table.resolve(0).is_none());
    }

    #[test]
    fn dead_task_degrades_to_hex() {
        let mut sym = UserSymbolizer::new();
        let frames = sym.format_stack(4_100_000_000, &[0x1000, 0x2000]);
        assert_eq!(frames, vec!["0x1000".to_string(), "0x2000".to_string()]);
    }

    #[test]
    fn own_stack_formats_without_panicking() {
        let mut sym = UserSymbolizer::new();
        let frames = sym.format_stack(std::process::id(), &[main_addr()]);
        assert_eq!(frames.len(), 1);
    }

    fn main_addr() -> u64 {
        // any address inside our own text segment
        let probe: fn() -> u64 = main_addr;
        probe as usize as u64
    }
}
