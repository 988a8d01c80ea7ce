//! Ring-buffer record processing.
//!
//! Consumes raw byte records from the three rings and turns them into CSV
//! or human-readable rows. The processor never touches aya types: the
//! drain loop hands it byte slices, which keeps the whole output path
//! testable with synthetic records.
//!
//! Drain order per tick is stacks -> samples -> completions, so a stack
//! row is on disk before the first sample row that references its hash.

use anyhow::Result;
use log::warn;
use std::collections::HashSet;
use std::io::Write;

use taskcap_common::{
    IorqCompletion, StackEvent, SyscallCompletion, TaskSample, EVENT_IORQ_COMPLETION,
    EVENT_SYSCALL_COMPLETION, MAX_STACK_DEPTH,
};

use crate::caches::{BoundedCache, UsernameCache};
use crate::cgroup::CgroupCache;
use crate::output::columns::{csv_sample_row, human_header, human_row, ColumnSpec};
use crate::output::rows::{
    build_sample_row, cgroup_row, iorq_completion_row, sc_completion_row, stack_row,
};
use crate::output::OutputFiles;
use crate::symbolize::{join_frames, KernelSymbols, UserSymbolizer};
use crate::timebase::TimeBase;

/// Where rows go.
pub enum OutputMode {
    /// Hourly CSV files, all columns.
    Csv(OutputFiles),
    /// Selected columns to a stream (stdout in production).
    Human {
        out: Box<dyn Write>,
        columns: Vec<&'static ColumnSpec>,
        print_stacks: bool,
        header_written: bool,
    },
}

/// Per-run record counters, logged periodically under verbose.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainStats {
    pub samples: u64,
    pub sc_completions: u64,
    pub iorq_completions: u64,
    pub kstacks: u64,
    pub ustacks: u64,
    pub cgroups: u64,
    pub malformed: u64,
}

pub struct EventProcessor {
    mode: OutputMode,
    base: TimeBase,
    weight_us: u64,
    users: UsernameCache,
    cgroups: CgroupCache,
    ksyms: KernelSymbols,
    usyms: UserSymbolizer,
    /// hash -> symbolized text; doubles as the per-run "already written"
    /// set for the stacks files
    kstack_text: BoundedCache<u64, String>,
    ustack_text: BoundedCache<u64, String>,
    /// unique hashes referenced by this tick's samples (human mode)
    tick_hashes: HashSet<(u64, bool)>,
    pub stats: DrainStats,
}

impl EventProcessor {
    #[must_use]
    pub fn new(mode: OutputMode, weight_us: u64, ksyms: KernelSymbols) -> Self {
        Self {
            mode,
            base: TimeBase::now(),
            weight_us,
            users: UsernameCache::new(),
            cgroups: CgroupCache::new(),
            ksyms,
            usyms: UserSymbolizer::new(),
            kstack_text: BoundedCache::new(65536),
            ustack_text: BoundedCache::new(65536),
            tick_hashes: HashSet::new(),
            stats: DrainStats::default(),
        }
    }

    /// Establish the wall/monotonic basis for every row of this tick.
    pub fn begin_tick(&mut self, base: TimeBase) {
        self.base = base;
        self.tick_hashes.clear();
    }

    /// One record from the sample ring.
    ///
    /// # Errors
    /// Returns an error only on output I/O failure; malformed records are
    /// counted and skipped.
    pub fn handle_sample(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(rec) = parse_record::<TaskSample>(bytes) else {
            self.note_malformed("sample", bytes.len());
            return Ok(());
        };
        self.stats.samples += 1;

        let hour = self.base.wall_from_ktime(rec.sample_start_ktime).local().hour_stamp();
        if let OutputMode::Csv(files) = &mut self.mode {
            if let Some(path) = self.cgroups.observe(rec.cgroup_id, rec.tid) {
                self.stats.cgroups += 1;
                files.cgroups.write_row(hour, &cgroup_row(rec.cgroup_id, &path))?;
            }
        }

        let username = self.users.lookup(rec.euid);
        let row = build_sample_row(&rec, &self.base, self.weight_us, username);

        match &mut self.mode {
            OutputMode::Csv(files) => {
                files.samples.write_row(hour, &csv_sample_row(&row))?;
            }
            OutputMode::Human { out, columns, print_stacks, header_written } => {
                if !*header_written {
                    writeln!(out, "{}", human_header(columns))?;
                    *header_written = true;
                }
                writeln!(out, "{}", human_row(columns, &row))?;
                if *print_stacks {
                    if rec.kstack_hash != 0 {
                        self.tick_hashes.insert((rec.kstack_hash, true));
                    }
                    if rec.ustack_hash != 0 {
                        self.tick_hashes.insert((rec.ustack_hash, false));
                    }
                }
            }
        }
        Ok(())
    }

    /// One record from the stack ring. Symbolizes, memoizes, and writes
    /// the stacks row unless this hash was already written this run.
    ///
    /// # Errors
    /// Returns an error only on output I/O failure.
    pub fn handle_stack(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(rec) = parse_record::<StackEvent>(bytes) else {
            self.note_malformed("stack", bytes.len());
            return Ok(());
        };
        let depth = (rec.depth as usize).min(MAX_STACK_DEPTH);
        let addrs = &rec.addrs[..depth];
        let kernel = rec.kernel != 0;

        let cache = if kernel { &self.kstack_text } else { &self.ustack_text };
        if cache.contains(&rec.hash) {
            return Ok(());
        }

        let text = if kernel {
            self.stats.kstacks += 1;
            join_frames(&addrs.iter().map(|&a| self.ksyms.format_frame(a)).collect::<Vec<_>>())
        } else {
            self.stats.ustacks += 1;
            join_frames(&self.usyms.format_stack(rec.tid, addrs))
        };

        if let OutputMode::Csv(files) = &mut self.mode {
            let hour = self.base.wall_now().local().hour_stamp();
            let writer = if kernel { &mut files.kstacks } else { &mut files.ustacks };
            writer.write_row(hour, &stack_row(rec.hash, &text))?;
        }

        if kernel {
            self.kstack_text.insert(rec.hash, text);
        } else {
            self.ustack_text.insert(rec.hash, text);
        }
        Ok(())
    }

    /// One record from the completions ring; the leading kind tag picks
    /// the record type.
    ///
    /// # Errors
    /// Returns an error only on output I/O failure.
    pub fn handle_completion(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 4 {
            self.note_malformed("completion", bytes.len());
            return Ok(());
        }
        let kind = u32::from_ne_bytes(bytes[..4].try_into().expect("4 bytes"));
        match kind {
            EVENT_SYSCALL_COMPLETION => {
                let Some(rec) = parse_record::<SyscallCompletion>(bytes) else {
                    self.note_malformed("syscall completion", bytes.len());
                    return Ok(());
                };
                self.stats.sc_completions += 1;
                if let OutputMode::Csv(files) = &mut self.mode {
                    let hour = self.base.wall_from_ktime(rec.exit_time).local().hour_stamp();
                    files.sc_completions.write_row(hour, &sc_completion_row(&rec, &self.base))?;
                }
            }
            EVENT_IORQ_COMPLETION => {
                let Some(rec) = parse_record::<IorqCompletion>(bytes) else {
                    self.note_malformed("iorq completion", bytes.len());
                    return Ok(());
                };
                self.stats.iorq_completions += 1;
                if let OutputMode::Csv(files) = &mut self.mode {
                    let hour = self.base.wall_from_ktime(rec.complete_time).local().hour_stamp();
                    files
                        .iorq_completions
                        .write_row(hour, &iorq_completion_row(&rec, &self.base))?;
                }
            }
            other => {
                // keep consuming; one bad record must not stall the drain
                eprintln!("unexpected event type {other} on completions ring");
                self.stats.malformed += 1;
            }
        }
        Ok(())
    }

    /// Tick epilogue: in human mode print each unique stack referenced by
    /// this tick's samples, then flush whatever was buffered.
    ///
    /// # Errors
    /// Returns an error on output I/O failure.
    pub fn end_tick(&mut self) -> Result<()> {
        match &mut self.mode {
            OutputMode::Csv(files) => files.flush_all()?,
            OutputMode::Human { out, print_stacks, .. } => {
                if *print_stacks {
                    let mut hashes: Vec<_> = self.tick_hashes.iter().copied().collect();
                    hashes.sort_unstable();
                    for (hash, kernel) in hashes {
                        let cache = if kernel { &self.kstack_text } else { &self.ustack_text };
                        if let Some(text) = cache.get(&hash) {
                            let tag = if kernel { "kstack" } else { "ustack" };
                            writeln!(out, "{tag} {hash:x}: {text}")?;
                        }
                    }
                }
                out.flush()?;
            }
        }
        self.tick_hashes.clear();
        Ok(())
    }

    fn note_malformed(&mut self, what: &str, len: usize) {
        self.stats.malformed += 1;
        warn!("malformed {what} record ({len} bytes)");
    }
}

/// Copy a fixed-size record out of a ring-buffer item. The rings are
/// written by our own programs, so a short item is corruption, not input.
fn parse_record<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; T is a Pod record written by the
    // kernel half as plain bytes
    #[allow(unsafe_code)]
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_record_is_rejected() {
        let bytes = [0u8; 4];
        assert!(parse_record::<TaskSample>(&bytes).is_none());
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut rec = TaskSample::zeroed();
        rec.tid = 42;
        rec.kstack_hash = 0xfeed;
        let bytes = record_bytes(&rec);
        let back = parse_record::<TaskSample>(bytes).unwrap();
        assert_eq!(back.tid, 42);
        assert_eq!(back.kstack_hash, 0xfeed);
    }

    pub(crate) fn record_bytes<T>(rec: &T) -> &[u8] {
        // SAFETY: viewing a repr(C) Pod record as bytes
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts(std::ptr::from_ref(rec).cast::<u8>(), std::mem::size_of::<T>())
        }
    }
}
