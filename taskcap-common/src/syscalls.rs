//! Syscall-number classification used by the filter policy and the
//! fd-resolution path. Numbers are per-architecture; the two supported
//! architectures are x86_64 and aarch64.

#[cfg(any(target_arch = "x86_64", target_arch = "bpf"))]
pub mod nr {
    pub const READ: i64 = 0;
    pub const WRITE: i64 = 1;
    pub const POLL: i64 = 7;
    pub const PREAD64: i64 = 17;
    pub const READV: i64 = 19;
    pub const SELECT: i64 = 23;
    pub const RECVFROM: i64 = 45;
    pub const RECVMSG: i64 = 47;
    pub const ACCEPT: i64 = 43;
    pub const FSYNC: i64 = 74;
    pub const FDATASYNC: i64 = 75;
    pub const IO_GETEVENTS: i64 = 208;
    pub const EPOLL_WAIT: i64 = 232;
    pub const PSELECT6: i64 = 270;
    pub const PPOLL: i64 = 271;
    pub const EPOLL_PWAIT: i64 = 281;
    pub const ACCEPT4: i64 = 288;
    pub const PREADV: i64 = 295;
    pub const RECVMMSG: i64 = 299;
    pub const PREADV2: i64 = 327;
    pub const IO_PGETEVENTS: i64 = 333;
    pub const IO_URING_ENTER: i64 = 426;
}

#[cfg(target_arch = "aarch64")]
pub mod nr {
    pub const IO_GETEVENTS: i64 = 4;
    pub const EPOLL_PWAIT: i64 = 22;
    pub const READ: i64 = 63;
    pub const WRITE: i64 = 64;
    pub const READV: i64 = 65;
    pub const PREAD64: i64 = 67;
    pub const PREADV: i64 = 69;
    pub const PSELECT6: i64 = 72;
    pub const PPOLL: i64 = 73;
    pub const FSYNC: i64 = 82;
    pub const FDATASYNC: i64 = 83;
    pub const ACCEPT: i64 = 202;
    pub const RECVFROM: i64 = 207;
    pub const RECVMSG: i64 = 212;
    pub const ACCEPT4: i64 = 242;
    pub const RECVMMSG: i64 = 243;
    pub const PREADV2: i64 = 286;
    pub const IO_PGETEVENTS: i64 = 292;
    pub const IO_URING_ENTER: i64 = 426;

    // x86-only numbers, kept so shared match arms compile on both arches
    pub const POLL: i64 = -1;
    pub const SELECT: i64 = -1;
    pub const EPOLL_WAIT: i64 = -1;
}

use nr::*;

/// Blocking reads: a task sleeping here with a socket fd is either an idle
/// daemon (filtered by port policy) or a genuine wait.
#[must_use]
pub fn is_read_family(n: i64) -> bool {
    n >= 0
        && (n == READ
            || n == READV
            || n == PREAD64
            || n == PREADV
            || n == PREADV2
            || n == RECVFROM
            || n == RECVMSG
            || n == RECVMMSG
            || n == ACCEPT
            || n == ACCEPT4)
}

/// First argument is a pollfd/fd-set rather than a plain fd; the sampler
/// scans the set for the first fd instead.
#[must_use]
pub fn is_poll_family(n: i64) -> bool {
    n >= 0
        && (n == POLL
            || n == PPOLL
            || n == SELECT
            || n == PSELECT6
            || n == EPOLL_WAIT
            || n == EPOLL_PWAIT)
}

#[must_use]
pub fn is_aio_getevents(n: i64) -> bool {
    n >= 0 && (n == IO_GETEVENTS || n == IO_PGETEVENTS)
}

#[must_use]
pub fn is_uring_enter(n: i64) -> bool {
    n == IO_URING_ENTER
}

/// Syscalls whose first argument register holds a file descriptor worth
/// resolving to a filename or socket endpoint.
#[must_use]
pub fn has_fd_first_arg(n: i64) -> bool {
    is_read_family(n)
        || is_uring_enter(n)
        || (n >= 0 && (n == WRITE || n == FSYNC || n == FDATASYNC))
}
