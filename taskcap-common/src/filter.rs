//! The "interesting task" predicate.
//!
//! Stateless: every input is a snapshot taken by the sampler, every
//! parameter is established at load time. The same code runs inside the
//! task iterator and in userspace tests.

use crate::state::{TASK_IDLE, TASK_INTERRUPTIBLE, TASK_RUNNING, TASK_UNINTERRUPTIBLE};
use crate::syscalls;

/// Load-time filter parameters (CONFIG map contents, decoded).
#[derive(Clone, Copy)]
pub struct FilterConfig {
    pub show_all: bool,
    /// Local ports at or below this are treated as server daemons and
    /// filtered out of interruptible-sleep samples.
    pub daemon_port: u16,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { show_all: false, daemon_port: 10000 }
    }
}

/// Snapshot of the fields the predicate looks at.
#[derive(Clone, Copy, Default)]
pub struct FilterInput {
    pub state: u32,
    pub kthread: bool,
    pub syscall_nr: i64, // -1 if not in a syscall
    pub aio_inflight: u32,
    pub uring_sq_pending: u32,
    pub uring_cq_pending: u32,
    pub inet_socket: bool, // first-arg fd resolved to a TCP/UDP socket
    pub local_port: u16,
    pub listening: bool, // TCP_LISTEN
}

/// Decide whether a task's sample should be emitted.
#[must_use]
pub fn task_is_interesting(cfg: FilterConfig, t: FilterInput) -> bool {
    // Idle kernel threads are never interesting, show-all included
    if t.kthread && t.state & TASK_IDLE == TASK_IDLE {
        return false;
    }
    if cfg.show_all {
        return true;
    }
    if t.state == TASK_RUNNING {
        return true;
    }
    // Real disk-style waits; TASK_IDLE was handled above for kthreads and
    // an idle-parked user task is not a wait
    if t.state & TASK_UNINTERRUPTIBLE != 0 && t.state & TASK_IDLE != TASK_IDLE {
        return true;
    }
    if t.state & TASK_INTERRUPTIBLE != 0 {
        // Blocked in io_getevents with requests actually in flight
        if syscalls::is_aio_getevents(t.syscall_nr) && t.aio_inflight > 0 {
            return true;
        }
        // Blocked in io_uring_enter with submitted or completed entries pending
        if syscalls::is_uring_enter(t.syscall_nr)
            && (t.uring_sq_pending > 0 || t.uring_cq_pending > 0)
        {
            return true;
        }
        // Socket reads: daemons accept-looping on well-known ports are
        // noise, ephemeral-port clients are genuine waits
        if syscalls::is_read_family(t.syscall_nr) && t.inet_socket {
            return !t.listening && t.local_port > cfg.daemon_port;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{TASK_NOLOAD, TASK_WAKEKILL};
    use crate::syscalls::nr;

    fn cfg() -> FilterConfig {
        FilterConfig::default()
    }

    #[test]
    fn running_is_always_interesting() {
        let t = FilterInput { state: TASK_RUNNING, ..Default::default() };
        assert!(task_is_interesting(cfg(), t));
    }

    #[test]
    fn uninterruptible_wait_is_interesting() {
        let t = FilterInput { state: TASK_UNINTERRUPTIBLE, ..Default::default() };
        assert!(task_is_interesting(cfg(), t));
        let t = FilterInput {
            state: TASK_UNINTERRUPTIBLE | TASK_WAKEKILL,
            ..Default::default()
        };
        assert!(task_is_interesting(cfg(), t));
    }

    #[test]
    fn idle_kthread_never_interesting() {
        let t = FilterInput {
            state: TASK_UNINTERRUPTIBLE | TASK_NOLOAD,
            kthread: true,
            ..Default::default()
        };
        assert!(!task_is_interesting(cfg(), t));
        // not even with show-all
        let all = FilterConfig { show_all: true, ..cfg() };
        assert!(!task_is_interesting(all, t));
    }

    #[test]
    fn plain_sleep_is_filtered_unless_show_all() {
        let t = FilterInput { state: TASK_INTERRUPTIBLE, ..Default::default() };
        assert!(!task_is_interesting(cfg(), t));
        let all = FilterConfig { show_all: true, ..cfg() };
        assert!(task_is_interesting(all, t));
    }

    #[test]
    fn aio_wait_needs_inflight_requests() {
        let mut t = FilterInput {
            state: TASK_INTERRUPTIBLE,
            syscall_nr: nr::IO_GETEVENTS,
            ..Default::default()
        };
        assert!(!task_is_interesting(cfg(), t), "idle reaper loop");
        t.aio_inflight = 3;
        assert!(task_is_interesting(cfg(), t), "real AIO wait");
    }

    #[test]
    fn uring_wait_needs_pending_entries() {
        let mut t = FilterInput {
            state: TASK_INTERRUPTIBLE,
            syscall_nr: nr::IO_URING_ENTER,
            ..Default::default()
        };
        assert!(!task_is_interesting(cfg(), t));
        t.uring_cq_pending = 1;
        assert!(task_is_interesting(cfg(), t));
    }

    #[test]
    fn daemon_port_policy_on_socket_reads() {
        let mut t = FilterInput {
            state: TASK_INTERRUPTIBLE,
            syscall_nr: nr::RECVFROM,
            inet_socket: true,
            local_port: 5432,
            ..Default::default()
        };
        assert!(!task_is_interesting(cfg(), t), "daemon port");
        t.local_port = 38422;
        assert!(task_is_interesting(cfg(), t), "ephemeral client port");
    }

    #[test]
    fn listen_socket_always_filtered() {
        let t = FilterInput {
            state: TASK_INTERRUPTIBLE,
            syscall_nr: nr::ACCEPT,
            inet_socket: true,
            local_port: 48000, // even above the threshold
            listening: true,
            ..Default::default()
        };
        assert!(!task_is_interesting(cfg(), t));
        // show-all overrides, so LISTEN states remain observable on demand
        let all = FilterConfig { show_all: true, ..cfg() };
        assert!(task_is_interesting(all, t));
    }
}
