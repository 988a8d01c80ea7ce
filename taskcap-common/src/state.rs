//! Task state bits and their display mnemonics.
//!
//! Bit values match `include/linux/sched.h`. The kernel renamed the field
//! holding them (`state` -> `__state` in 5.14) but the bits themselves are
//! stable ABI via the sched tracepoints.

pub const TASK_RUNNING: u32 = 0x0000;
pub const TASK_INTERRUPTIBLE: u32 = 0x0001;
pub const TASK_UNINTERRUPTIBLE: u32 = 0x0002;
pub const TASK_STOPPED: u32 = 0x0004;
pub const TASK_TRACED: u32 = 0x0008;
pub const EXIT_DEAD: u32 = 0x0010;
pub const EXIT_ZOMBIE: u32 = 0x0020;
pub const TASK_PARKED: u32 = 0x0040;
pub const TASK_DEAD: u32 = 0x0080;
pub const TASK_WAKEKILL: u32 = 0x0100;
pub const TASK_WAKING: u32 = 0x0200;
pub const TASK_NOLOAD: u32 = 0x0400;
pub const TASK_NEW: u32 = 0x0800;

/// Idle kernel threads park in this combination; it must never count as a
/// real uninterruptible wait.
pub const TASK_IDLE: u32 = TASK_UNINTERRUPTIBLE | TASK_NOLOAD;

/// Short mnemonic for a raw state word. The `Q`/`M` suffixes for
/// on-runqueue and migration-pending are appended by the row formatter,
/// which is the only other place state strings appear.
#[must_use]
pub fn state_label(state: u32) -> &'static str {
    if state == TASK_RUNNING {
        return "RUN";
    }
    if state & TASK_IDLE == TASK_IDLE {
        return "IDLE";
    }
    if state & TASK_UNINTERRUPTIBLE != 0 {
        return "DISK";
    }
    if state & TASK_INTERRUPTIBLE != 0 {
        return "SLEEP";
    }
    if state & (TASK_STOPPED | TASK_TRACED) != 0 {
        return "STOPPED";
    }
    if state & TASK_WAKING != 0 {
        return "WAKING";
    }
    if state & TASK_NOLOAD != 0 {
        return "NOLOAD";
    }
    if state & TASK_NEW != 0 {
        return "NEW";
    }
    if state & (TASK_DEAD | EXIT_DEAD | EXIT_ZOMBIE) != 0 {
        return "DEAD";
    }
    if state & TASK_PARKED != 0 {
        return "PARKED";
    }
    "UNKNOWN"
}
