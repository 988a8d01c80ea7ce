#![cfg_attr(not(test), no_std)]

// Shared data structures and policy code between eBPF and userspace

pub mod filter;
pub mod hash;
pub mod state;
pub mod syscalls;

/// Record kinds on the completions ring buffer
pub const EVENT_SYSCALL_COMPLETION: u32 = 1;
pub const EVENT_IORQ_COMPLETION: u32 = 2;

/// Keys in the CONFIG map (values are u64, established at load time)
pub const CFG_SHOW_ALL: u32 = 0;
pub const CFG_FILTER_TGID: u32 = 1;
pub const CFG_DAEMON_PORT: u32 = 2;
pub const CFG_KSTACK: u32 = 3;
pub const CFG_USTACK: u32 = 4;
pub const CFG_SELF_TGID: u32 = 5;

pub const TASK_COMM_LEN: usize = 16;
pub const EXE_NAME_LEN: usize = 16;
pub const FILENAME_LEN: usize = 64;

/// Maximum number of stack frames captured per stack
pub const MAX_STACK_DEPTH: usize = 96;

/// Sample flag bits (`TaskSample::flags`), orthogonal to the state bits
pub const TSF_ON_RQ: u32 = 1 << 0; // queued on a runqueue
pub const TSF_ON_CPU: u32 = 1 << 1; // currently executing
pub const TSF_MIGRATION_PENDING: u32 = 1 << 2;
pub const TSF_KTHREAD: u32 = 1 << 3;

/// Socket endpoint snapshot for the sampled task's first-argument fd.
/// `family == 0` means the fd was not backed by an inet socket.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ConnInfo {
    pub family: u16, // AF_INET / AF_INET6, 0 = none
    pub protocol: u8, // IPPROTO_TCP / IPPROTO_UDP
    pub tcp_state: u8, // TCP_ESTABLISHED..TCP_LISTEN, 0 for non-TCP
    pub local_port: u16,
    pub remote_port: u16,
    pub local_addr: [u8; 16], // IPv4 uses the first 4 bytes
    pub remote_addr: [u8; 16],
}

/// One sample of one task's extended state, emitted per selected task per
/// tick on the SAMPLES ring. Userspace derives wall timestamps, elapsed
/// syscall time and all display strings from these raw fields.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaskSample {
    pub sample_start_ktime: u64, // common to all tasks of one sweep
    pub sample_actual_ktime: u64, // when this task was read
    pub cgroup_id: u64,
    pub sc_enter_time: u64, // entry ktime of the current syscall (may be synthesized)
    pub sc_sequence_num: u64,
    pub iorq_sequence_num: u64,
    pub syscall_args: [u64; 6],
    pub uring_offset: u64,
    pub kstack_hash: u64, // 0 = no stack captured
    pub ustack_hash: u64,

    pub tid: u32,
    pub tgid: u32,
    pub pidns_id: u32,
    pub euid: u32,
    pub state: u32, // raw task state bits, see `state` module
    pub flags: u32, // TSF_* bits
    pub aio_inflight: u32,
    pub uring_sq_pending: u32,
    pub uring_cq_pending: u32,
    pub uring_len: u32,
    pub syscall_nr: i32,        // from saved registers, -1 if not in a syscall
    pub active_syscall_nr: i32, // from the tracker, may differ if entry predates tracking

    pub conn: ConnInfo,

    pub comm: [u8; TASK_COMM_LEN],
    pub exe: [u8; EXE_NAME_LEN],
    pub filename: [u8; FILENAME_LEN],
    pub uring_opcode: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: [u8; 7],
}

impl TaskSample {
    /// All-zero sample. Valid for any Pod record.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Emitted on syscall exit, but only when the sampler witnessed the entry
/// (`TaskState::sc_sampled`). Pairs with exactly one sample record via
/// `(tid, sc_sequence_num)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SyscallCompletion {
    pub kind: u32, // EVENT_SYSCALL_COMPLETION
    pub tid: u32,
    pub tgid: u32,
    pub syscall_nr: i32,
    pub enter_time: u64,
    pub exit_time: u64,
    pub sc_sequence_num: u64,
    pub ret: i64,
}

/// Emitted on block-I/O completion when the in-flight request was witnessed
/// by a sample. Pairs via `(insert_tid, iorq_sequence_num)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IorqCompletion {
    pub kind: u32, // EVENT_IORQ_COMPLETION
    pub insert_tid: u32,
    pub insert_tgid: u32,
    pub issue_tid: u32,
    pub issue_tgid: u32,
    pub complete_tid: u32,
    pub complete_tgid: u32,
    pub dev: u32, // encoded (major << 20) | minor
    pub sector: u64,
    pub iorq_sequence_num: u64,
    pub insert_time: u64,
    pub issue_time: u64,
    pub complete_time: u64,
    pub bytes: u32,
    pub cmd_flags: u32, // raw REQ_OP | REQ_* bits, decoded by the formatter
    pub error: i32,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: u32,
}

/// One deduplicated stack trace. Emitted at most once per hash per
/// emitted-set lifetime; samples reference it by hash only.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StackEvent {
    pub hash: u64,
    pub tid: u32, // originating task, for userspace symbol resolution
    pub depth: u32,
    pub kernel: u8, // 1 = kernel stack, 0 = user stack
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: [u8; 7],
    pub addrs: [u64; MAX_STACK_DEPTH],
}

impl StackEvent {
    #[must_use]
    #[allow(unsafe_code)]
    pub fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Per-task storage, created on first touch and evicted by LRU when the
/// task dies. Written by the task's own tracepoint context; the sampler
/// only reads snapshots and sets the two `*_sampled` bits.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaskState {
    pub sc_enter_time: u64,
    pub sc_sequence_num: u64,
    pub iorq_sequence_num: u64,
    pub last_iorq_ptr: u64, // kernel request pointer of the last submission
    pub last_iorq_sector: u64,
    pub csw_prev: u64, // nvcsw + nivcsw at the previous sample
    pub kstack_hash: u64, // cached hash of the last captured kernel stack
    pub ustack_hash: u64,
    pub tid: u32,
    pub tgid: u32,
    pub last_iorq_dev: u32,
    pub aio_inflight: u32, // precomputed on io_getevents entry
    pub in_syscall_nr: i32, // -1 if not in a syscall
    pub sc_sampled: u8, // set by the sampler, cleared by the exit path
    pub last_iorq_sampled: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: [u8; 2],
}

impl Default for TaskState {
    fn default() -> Self {
        // all-zero except the syscall slot: 0 is a real syscall number
        #[allow(unsafe_code)]
        let mut st: Self = unsafe { core::mem::zeroed() };
        st.in_syscall_nr = -1;
        st
    }
}

/// Block-I/O tracker entry, keyed by the kernel request pointer. The
/// identity triple `(pointer, insert_tid, iorq_sequence_num)` defends
/// against rapid pointer reuse.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct IorqTrack {
    pub iorq_sequence_num: u64,
    pub insert_time: u64,
    pub issue_time: u64,
    pub sector: u64,
    pub insert_tid: u32,
    pub insert_tgid: u32,
    pub issue_tid: u32,
    pub issue_tgid: u32,
    pub dev: u32,
    pub bytes: u32,
    pub cmd_flags: u32,
    pub sampled: u8, // set by the sampler after the identity check
    #[allow(clippy::pub_underscore_fields)]
    pub _pad: [u8; 3],
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication:
// Pod marks the records as safely transmissible as plain bytes.
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TaskSample {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SyscallCompletion {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for IorqCompletion {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for StackEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TaskState {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for IorqTrack {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ConnInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    // Ring-buffer records are read back with read_unaligned on the exact
    // struct size; a silent layout change would corrupt every field after
    // the shifted one.
    #[test]
    fn record_sizes_are_stable() {
        assert_eq!(core::mem::size_of::<ConnInfo>(), 40);
        assert_eq!(core::mem::size_of::<SyscallCompletion>(), 48);
        assert_eq!(core::mem::size_of::<IorqCompletion>(), 88);
        assert_eq!(core::mem::size_of::<StackEvent>(), 24 + 8 * MAX_STACK_DEPTH);
        assert_eq!(core::mem::size_of::<TaskSample>() % 8, 0);
        assert_eq!(core::mem::size_of::<TaskState>() % 8, 0);
        assert_eq!(core::mem::size_of::<IorqTrack>() % 8, 0);
    }

    #[test]
    fn fresh_task_state_is_not_in_a_syscall() {
        let st = TaskState::default();
        assert_eq!(st.in_syscall_nr, -1);
        assert_eq!(st.sc_sequence_num, 0);
        assert_eq!(st.sc_sampled, 0);
    }

    #[test]
    fn completion_kind_is_first_field() {
        let c = SyscallCompletion {
            kind: EVENT_SYSCALL_COMPLETION,
            tid: 7,
            tgid: 7,
            syscall_nr: 0,
            enter_time: 1,
            exit_time: 2,
            sc_sequence_num: 3,
            ret: 0,
        };
        #[allow(unsafe_code)]
        let bytes = unsafe {
            core::slice::from_raw_parts(
                core::ptr::addr_of!(c).cast::<u8>(),
                core::mem::size_of::<SyscallCompletion>(),
            )
        };
        let kind = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
        assert_eq!(kind, EVENT_SYSCALL_COMPLETION);
    }
}
