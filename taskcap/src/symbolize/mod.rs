//! Stack symbolization.
//!
//! Kernel frames resolve against `/proc/kallsyms`; user frames against the
//! ELF symbol table of the owning process's executable, adjusted for PIE
//! load bias via `/proc/<pid>/maps`. Every resolver degrades to bare hex
//! rather than failing: a stacks row must always be writable.

pub mod kallsyms;
pub mod maps;
pub mod user;

pub use kallsyms::KernelSymbols;
pub use maps::{exe_memory_range, MemoryRange};
pub use user::UserSymbolizer;

/// Join resolved frames the way the stacks files expect.
#[must_use]
pub fn join_frames(frames: &[String]) -> String {
    frames.join(";")
}
