//! Kernel-side half of taskcap.
//!
//! Three groups of programs share one object file and its maps:
//!
//! - `sample_tasks`: a sleepable task iterator, triggered once per tick by
//!   the userspace read. Applies the filter policy, gathers the extended
//!   task-state record, captures deduplicated stacks, and marks witnessed
//!   syscalls/block requests so their completions get emitted.
//! - `sys_enter`/`sys_exit`: raw_syscalls tracepoints maintaining per-task
//!   syscall sequence and timing; exit emits a completion only when the
//!   sampler witnessed the entry.
//! - `block_rq_insert`/`block_rq_issue`/`block_rq_complete`: raw
//!   tracepoints tracking block requests by request pointer; complete
//!   emits only when the in-flight request was witnessed by a sample.
//!
//! Ring-buffer reservations that fail are dropped records by design: the
//! tracked workload must never stall on the profiler.

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

mod arch;
mod kernel;

use aya_ebpf::{
    cty::c_void,
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, gen},
    macros::{iter, map, raw_tracepoint, tracepoint},
    maps::{Array, HashMap, LruHashMap, RingBuf},
    programs::{IterContext, RawTracePointContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use taskcap_common::{
    filter::{task_is_interesting, FilterConfig, FilterInput},
    hash::stack_hash,
    state::TASK_IDLE,
    syscalls, ConnInfo, IorqCompletion, IorqTrack, StackEvent, SyscallCompletion, TaskSample,
    TaskState, CFG_DAEMON_PORT, CFG_FILTER_TGID, CFG_KSTACK, CFG_SELF_TGID, CFG_SHOW_ALL,
    CFG_USTACK, EVENT_IORQ_COMPLETION, EVENT_SYSCALL_COMPLETION, FILENAME_LEN, MAX_STACK_DEPTH,
    TSF_KTHREAD, TSF_MIGRATION_PENDING, TSF_ON_CPU, TSF_ON_RQ,
};

// ============================================================================
// Maps
// ============================================================================

/// Task samples, one record per selected task per sweep
#[map]
static SAMPLES: RingBuf = RingBuf::with_byte_size(16 * 1024 * 1024, 0);

/// Syscall and block-I/O completions, discriminated by a leading kind tag
#[map]
static COMPLETIONS: RingBuf = RingBuf::with_byte_size(16 * 1024 * 1024, 0);

/// Deduplicated stack traces
#[map]
static STACKS: RingBuf = RingBuf::with_byte_size(16 * 1024 * 1024, 0);

/// Per-task storage; LRU eviction reclaims entries of dead tasks
#[map]
static TASK_STATE: LruHashMap<u32, TaskState> = LruHashMap::with_max_entries(16384, 0);

/// Block requests in flight, keyed by request pointer
#[map]
static IORQ_TRACKER: LruHashMap<u64, IorqTrack> = LruHashMap::with_max_entries(8192, 0);

/// Stack hashes already emitted; eviction causes a benign re-emission
#[map]
static EMITTED_STACKS: LruHashMap<u64, u8> = LruHashMap::with_max_entries(65536, 0);

/// Load-time parameters from userspace
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// ktime of the current sweep's first task, shared by all its samples
#[map]
static SWEEP_START: Array<u64> = Array::with_max_entries(1, 0);

fn cfg(key: u32, default: u64) -> u64 {
    unsafe { CONFIG.get(&key).copied().unwrap_or(default) }
}

// ============================================================================
// Syscall tracker
// ============================================================================

/// raw_syscalls:sys_enter tracepoint data after the common header
#[repr(C)]
struct SysEnterArgs {
    __unused__: u64,
    id: i64,
    args: [u64; 6],
}

/// raw_syscalls:sys_exit tracepoint data after the common header
#[repr(C)]
struct SysExitArgs {
    __unused__: u64,
    id: i64,
    ret: i64,
}

#[tracepoint]
pub fn sys_enter(ctx: TracePointContext) -> u32 {
    match try_sys_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_enter(ctx: &TracePointContext) -> Result<(), i64> {
    let args = unsafe { &*(ctx.as_ptr() as *const SysEnterArgs) };
    let pid_tgid = bpf_get_current_pid_tgid();
    let tid = pid_tgid as u32;

    let mut st = unsafe { TASK_STATE.get(&tid).copied().unwrap_or_default() };
    st.tid = tid;
    st.tgid = (pid_tgid >> 32) as u32;
    st.in_syscall_nr = args.id as i32;
    st.sc_enter_time = unsafe { bpf_ktime_get_ns() };
    st.sc_sequence_num += 1;
    // new entry: not witnessed yet
    st.sc_sampled = 0;

    // precompute AIO occupancy for the next sweep; args[0] is the ring
    // address and we are in the task's own context here
    if syscalls::is_aio_getevents(args.id) {
        let current = unsafe { gen::bpf_get_current_task() } as *const u8;
        st.aio_inflight = unsafe { kernel::aio_inflight(current, args.args[0]) };
    } else {
        st.aio_inflight = 0;
    }

    unsafe {
        TASK_STATE.insert(&tid, &st, 0)?;
    }
    Ok(())
}

#[tracepoint]
pub fn sys_exit(ctx: TracePointContext) -> u32 {
    match try_sys_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_exit(ctx: &TracePointContext) -> Result<(), i64> {
    let args = unsafe { &*(ctx.as_ptr() as *const SysExitArgs) };
    let tid = bpf_get_current_pid_tgid() as u32;

    let Some(mut st) = (unsafe { TASK_STATE.get(&tid).copied() }) else {
        return Ok(());
    };

    if st.sc_sampled != 0 {
        let completion = SyscallCompletion {
            kind: EVENT_SYSCALL_COMPLETION,
            tid: st.tid,
            tgid: st.tgid,
            syscall_nr: st.in_syscall_nr,
            enter_time: st.sc_enter_time,
            exit_time: unsafe { bpf_ktime_get_ns() },
            sc_sequence_num: st.sc_sequence_num,
            ret: args.ret,
        };
        // a full ring drops the record, never stalls the task
        let _ = COMPLETIONS.output(&completion, 0);
    }

    st.sc_sampled = 0;
    st.in_syscall_nr = -1;
    st.sc_enter_time = 0;
    unsafe {
        TASK_STATE.insert(&tid, &st, 0)?;
    }
    Ok(())
}

// ============================================================================
// Block-I/O tracker
// ============================================================================

#[raw_tracepoint(tracepoint = "block_rq_insert")]
pub fn block_rq_insert(ctx: RawTracePointContext) -> u32 {
    match try_block_rq_insert(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_block_rq_insert(ctx: &RawTracePointContext) -> Result<(), i64> {
    // raw tracepoint args: (struct request *rq)
    let rq = unsafe { *(ctx.as_ptr() as *const u64) };
    if rq == 0 {
        return Ok(());
    }
    let pid_tgid = bpf_get_current_pid_tgid();
    let tid = pid_tgid as u32;
    let now = unsafe { bpf_ktime_get_ns() };
    let (dev, sector, bytes, cmd_flags) = unsafe { kernel::request_fields(rq as *const u8) };

    let mut st = unsafe { TASK_STATE.get(&tid).copied().unwrap_or_default() };
    st.tid = tid;
    st.tgid = (pid_tgid >> 32) as u32;
    st.iorq_sequence_num += 1;
    st.last_iorq_ptr = rq;
    st.last_iorq_dev = dev;
    st.last_iorq_sector = sector;
    st.last_iorq_sampled = 0;
    unsafe {
        TASK_STATE.insert(&tid, &st, 0)?;
    }

    let track = IorqTrack {
        iorq_sequence_num: st.iorq_sequence_num,
        insert_time: now,
        issue_time: 0,
        sector,
        insert_tid: tid,
        insert_tgid: st.tgid,
        issue_tid: 0,
        issue_tgid: 0,
        dev,
        bytes,
        cmd_flags,
        sampled: 0,
        _pad: [0; 3],
    };
    unsafe {
        IORQ_TRACKER.insert(&rq, &track, 0)?;
    }
    Ok(())
}

#[raw_tracepoint(tracepoint = "block_rq_issue")]
pub fn block_rq_issue(ctx: RawTracePointContext) -> u32 {
    match try_block_rq_issue(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_block_rq_issue(ctx: &RawTracePointContext) -> Result<(), i64> {
    let rq = unsafe { *(ctx.as_ptr() as *const u64) };
    if rq == 0 {
        return Ok(());
    }
    let pid_tgid = bpf_get_current_pid_tgid();
    let now = unsafe { bpf_ktime_get_ns() };

    // create the entry if the insert was missed (request merged, or we
    // attached mid-flight)
    let mut track = unsafe { IORQ_TRACKER.get(&rq).copied().unwrap_or_default() };
    if track.insert_time == 0 {
        let (dev, sector, bytes, cmd_flags) = unsafe { kernel::request_fields(rq as *const u8) };
        track.dev = dev;
        track.sector = sector;
        track.bytes = bytes;
        track.cmd_flags = cmd_flags;
        track.insert_time = now;
        track.insert_tid = pid_tgid as u32;
        track.insert_tgid = (pid_tgid >> 32) as u32;
    }
    track.issue_tid = pid_tgid as u32;
    track.issue_tgid = (pid_tgid >> 32) as u32;
    track.issue_time = now;
    unsafe {
        IORQ_TRACKER.insert(&rq, &track, 0)?;
    }
    Ok(())
}

#[raw_tracepoint(tracepoint = "block_rq_complete")]
pub fn block_rq_complete(ctx: RawTracePointContext) -> u32 {
    match try_block_rq_complete(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_block_rq_complete(ctx: &RawTracePointContext) -> Result<(), i64> {
    // raw tracepoint args: (struct request *rq, blk_status_t error,
    // unsigned int nr_bytes)
    let raw = ctx.as_ptr() as *const u64;
    let rq = unsafe { *raw };
    if rq == 0 {
        return Ok(());
    }
    let error = unsafe { *raw.add(1) } as i32;

    let Some(track) = (unsafe { IORQ_TRACKER.get(&rq).copied() }) else {
        return Ok(());
    };

    if track.sampled != 0 {
        let pid_tgid = bpf_get_current_pid_tgid();
        let completion = IorqCompletion {
            kind: EVENT_IORQ_COMPLETION,
            insert_tid: track.insert_tid,
            insert_tgid: track.insert_tgid,
            issue_tid: track.issue_tid,
            issue_tgid: track.issue_tgid,
            complete_tid: pid_tgid as u32,
            complete_tgid: (pid_tgid >> 32) as u32,
            dev: track.dev,
            sector: track.sector,
            iorq_sequence_num: track.iorq_sequence_num,
            insert_time: track.insert_time,
            issue_time: track.issue_time,
            complete_time: unsafe { bpf_ktime_get_ns() },
            bytes: track.bytes,
            cmd_flags: track.cmd_flags,
            error,
            _pad: 0,
        };
        let _ = COMPLETIONS.output(&completion, 0);
    }

    unsafe {
        IORQ_TRACKER.remove(&rq)?;
    }
    Ok(())
}

// ============================================================================
// Task sampler (iterator)
// ============================================================================

/// bpf_iter__task context: (meta, task)
#[repr(C)]
struct TaskIterCtx {
    meta: *const IterMeta,
    task: *const u8,
}

#[repr(C)]
struct IterMeta {
    seq: *const c_void,
    session_id: u64,
    seq_num: u64,
}

#[iter(name = "task", sleepable)]
pub fn sample_tasks(ctx: IterContext) -> u32 {
    match try_sample_task(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[allow(clippy::too_many_lines)]
fn try_sample_task(ctx: &IterContext) -> Result<(), i64> {
    let ic = unsafe { &*(ctx.as_ptr() as *const TaskIterCtx) };
    let task = ic.task;
    if task.is_null() {
        // end of sweep
        return Ok(());
    }

    let now = unsafe { bpf_ktime_get_ns() };

    // the first task of a sweep pins the common start timestamp
    let seq_num = unsafe { (*ic.meta).seq_num };
    if seq_num == 0 {
        if let Some(start) = SWEEP_START.get_ptr_mut(0) {
            unsafe { *start = now };
        }
        debug!(ctx, "sweep started");
    }
    let sample_start = SWEEP_START.get(0).copied().unwrap_or(now);

    let state = unsafe { kernel::task_state(task) };
    let kthread = unsafe { kernel::task_is_kthread(task) };

    // early rejects: parked idle kthreads and the sampler itself
    if kthread && state & TASK_IDLE == TASK_IDLE {
        return Ok(());
    }
    let tid = unsafe { kernel::task_pid(task) };
    let tgid = unsafe { kernel::task_tgid(task) };
    if tid == 0 || u64::from(tgid) == cfg(CFG_SELF_TGID, 0) {
        return Ok(());
    }
    let filter_tgid = cfg(CFG_FILTER_TGID, 0);
    if filter_tgid != 0 && u64::from(tgid) != filter_tgid {
        return Ok(());
    }

    let on_cpu = unsafe { kernel::task_on_cpu(task) };
    let csw = unsafe { kernel::task_csw_count(task) };

    let mut st = unsafe { TASK_STATE.get(&tid).copied().unwrap_or_default() };
    st.tid = tid;
    st.tgid = tgid;

    // saved registers of the interrupted/blocked task
    let mut syscall_nr: i64 = -1;
    let mut args = [0u64; 6];
    if !kthread {
        let regs = unsafe { gen::bpf_task_pt_regs(task.cast_mut().cast()) };
        if !regs.is_null() {
            let regs = regs.cast::<u8>().cast_const();
            syscall_nr = unsafe { arch::syscall_nr(regs) };
            unsafe { arch::syscall_args(regs, &mut args) };
        }
    }

    // resolve the waited-on fd to a filename or socket endpoint
    let mut filename = [0u8; FILENAME_LEN];
    let mut conn = ConnInfo::default();
    let mut aio_inflight = st.aio_inflight;
    let mut uring_sq = 0u32;
    let mut uring_cq = 0u32;
    let mut uring_opcode = 0u8;
    let mut uring_offset = 0u64;
    let mut uring_len = 0u32;

    if syscall_nr >= 0 {
        let fd = if syscalls::is_poll_family(syscall_nr) {
            unsafe { kernel::poll_first_fd(task, args[0]) }
        } else if syscalls::has_fd_first_arg(syscall_nr) {
            args[0] as i32
        } else {
            -1
        };

        if let Some(file) = unsafe { kernel::task_file(task, fd) } {
            if unsafe { kernel::file_is_socket(file) } {
                conn = unsafe { kernel::socket_conn_info(file) };
            } else {
                unsafe { kernel::file_basename(file, &mut filename) };
                if syscalls::is_uring_enter(syscall_nr) {
                    if let Some(snap) = unsafe { kernel::uring_snapshot(file) } {
                        uring_sq = snap.sq_pending;
                        uring_cq = snap.cq_pending;
                        uring_opcode = snap.opcode;
                        uring_offset = snap.offset;
                        uring_len = snap.len;
                        // the SQE's target fd names the file being waited on
                        if let Some(target) = unsafe { kernel::task_file(task, snap.sqe_fd) } {
                            if unsafe { kernel::file_is_socket(target) } {
                                conn = unsafe { kernel::socket_conn_info(target) };
                            } else {
                                unsafe { kernel::file_basename(target, &mut filename) };
                            }
                        }
                    }
                }
            }
        }

        if syscalls::is_aio_getevents(syscall_nr) && aio_inflight == 0 {
            aio_inflight = unsafe { kernel::aio_inflight(task, args[0]) };
        }
    }

    const TCP_LISTEN: u8 = 10;
    let interesting = task_is_interesting(
        FilterConfig {
            show_all: cfg(CFG_SHOW_ALL, 0) != 0,
            daemon_port: cfg(CFG_DAEMON_PORT, 10000) as u16,
        },
        FilterInput {
            state,
            kthread,
            syscall_nr,
            aio_inflight,
            uring_sq_pending: uring_sq,
            uring_cq_pending: uring_cq,
            inet_socket: conn.family != 0,
            local_port: conn.local_port,
            listening: conn.tcp_state == TCP_LISTEN,
        },
    );
    if !interesting {
        return Ok(());
    }

    // the task was already in this syscall when tracking began: adopt it
    if st.in_syscall_nr < 0 && syscall_nr >= 0 {
        st.in_syscall_nr = syscall_nr as i32;
    }
    // tracking started mid-syscall: synthesize the entry time to "now" so
    // elapsed time starts at zero instead of underflowing
    if st.in_syscall_nr >= 0 && st.sc_enter_time == 0 {
        st.sc_enter_time = now;
    }
    // witness mark: the exit path emits a completion for this entry
    if st.in_syscall_nr >= 0 {
        st.sc_sampled = 1;
    }

    // witness the outstanding block request, identity triple checked
    // against pointer reuse
    if st.last_iorq_ptr != 0 {
        if let Some(track) = unsafe { IORQ_TRACKER.get(&st.last_iorq_ptr).copied() } {
            if track.iorq_sequence_num == st.iorq_sequence_num && track.insert_tid == tid {
                let mut track = track;
                track.sampled = 1;
                unsafe {
                    IORQ_TRACKER.insert(&st.last_iorq_ptr, &track, 0)?;
                }
                st.last_iorq_sampled = 1;
            }
        }
    }

    // stacks: refresh on-CPU tasks and tasks that were scheduled since the
    // previous sample; a still-sleeping task keeps its cached hash
    let stale = on_cpu || csw != st.csw_prev;
    if cfg(CFG_KSTACK, 1) != 0 && (stale || st.kstack_hash == 0) {
        st.kstack_hash = capture_stack(task, tid, false).unwrap_or(st.kstack_hash);
    }
    if cfg(CFG_USTACK, 0) != 0 && !kthread && (stale || st.ustack_hash == 0) {
        st.ustack_hash = capture_stack(task, tid, true).unwrap_or(st.ustack_hash);
    }
    st.csw_prev = csw;

    unsafe {
        TASK_STATE.insert(&tid, &st, 0)?;
    }

    submit_sample(
        task,
        &st,
        SampleScalars {
            sample_start,
            now,
            state,
            kthread,
            on_cpu,
            syscall_nr,
            args,
            filename,
            conn,
            aio_inflight,
            uring_sq,
            uring_cq,
            uring_opcode,
            uring_offset,
            uring_len,
        },
    );
    Ok(())
}

/// Everything the sample record needs beyond per-task storage.
struct SampleScalars {
    sample_start: u64,
    now: u64,
    state: u32,
    kthread: bool,
    on_cpu: bool,
    syscall_nr: i64,
    args: [u64; 6],
    filename: [u8; FILENAME_LEN],
    conn: ConnInfo,
    aio_inflight: u32,
    uring_sq: u32,
    uring_cq: u32,
    uring_opcode: u8,
    uring_offset: u64,
    uring_len: u32,
}

/// Reserve, fill and submit one sample record. The record is built inside
/// the ring-buffer reservation; it does not fit the BPF stack.
fn submit_sample(task: *const u8, st: &TaskState, s: SampleScalars) {
    let Some(mut entry) = SAMPLES.reserve::<TaskSample>(0) else {
        // consumer behind: drop the sample
        return;
    };
    let rec = entry.as_mut_ptr();
    unsafe {
        core::ptr::write_bytes(rec.cast::<u8>(), 0, core::mem::size_of::<TaskSample>());
        (*rec).sample_start_ktime = s.sample_start;
        (*rec).sample_actual_ktime = s.now;
        (*rec).cgroup_id = kernel::task_cgroup_id(task);
        (*rec).sc_enter_time = st.sc_enter_time;
        (*rec).sc_sequence_num = st.sc_sequence_num;
        (*rec).iorq_sequence_num = st.iorq_sequence_num;
        (*rec).syscall_args = s.args;
        (*rec).uring_offset = s.uring_offset;
        (*rec).kstack_hash = st.kstack_hash;
        (*rec).ustack_hash = st.ustack_hash;
        (*rec).tid = st.tid;
        (*rec).tgid = st.tgid;
        (*rec).pidns_id = kernel::task_pidns_inum(task);
        (*rec).euid = kernel::task_euid(task);
        (*rec).state = s.state;
        (*rec).flags = sample_flags(task, s.kthread, s.on_cpu);
        (*rec).aio_inflight = s.aio_inflight;
        (*rec).uring_sq_pending = s.uring_sq;
        (*rec).uring_cq_pending = s.uring_cq;
        (*rec).uring_len = s.uring_len;
        (*rec).syscall_nr = s.syscall_nr as i32;
        (*rec).active_syscall_nr = st.in_syscall_nr;
        (*rec).conn = s.conn;
        kernel::task_comm(task, &mut (*rec).comm);
        kernel::task_exe_basename(task, &mut (*rec).exe);
        (*rec).filename = s.filename;
        (*rec).uring_opcode = s.uring_opcode;
    }
    entry.submit(0);
}

fn sample_flags(task: *const u8, kthread: bool, on_cpu: bool) -> u32 {
    let mut flags = 0;
    if unsafe { kernel::task_on_rq(task) } {
        flags |= TSF_ON_RQ;
    }
    if on_cpu {
        flags |= TSF_ON_CPU;
    }
    if unsafe { kernel::task_migration_pending(task) } {
        flags |= TSF_MIGRATION_PENDING;
    }
    if kthread {
        flags |= TSF_KTHREAD;
    }
    flags
}

const BPF_F_USER_STACK: u64 = 1 << 8;

/// Capture one stack of `task` into a ring reservation, hash it, and emit
/// it unless that hash is already out. Returns the hash either way; None
/// means the capture itself failed (hash cache stays as-is).
fn capture_stack(task: *const u8, tid: u32, user: bool) -> Option<u64> {
    unsafe { kernel::task_stack_ptr(task)? };

    let mut entry = STACKS.reserve::<StackEvent>(0)?;
    let rec = entry.as_mut_ptr();

    let flags = if user { BPF_F_USER_STACK } else { 0 };
    let size = (MAX_STACK_DEPTH * 8) as u32;
    let read = unsafe {
        gen::bpf_get_task_stack(
            task.cast_mut().cast(),
            (*rec).addrs.as_mut_ptr().cast::<c_void>(),
            size,
            flags,
        )
    };
    if read <= 0 {
        entry.discard(0);
        return None;
    }
    let depth = (read as usize / 8).min(MAX_STACK_DEPTH);
    let hash = unsafe { stack_hash(&(*rec).addrs[..depth]) };

    if unsafe { EMITTED_STACKS.get(&hash).is_some() } {
        entry.discard(0);
        return Some(hash);
    }

    unsafe {
        (*rec).hash = hash;
        (*rec).tid = tid;
        (*rec).depth = depth as u32;
        (*rec).kernel = u8::from(!user);
        (*rec)._pad = [0; 7];
    }
    entry.submit(0);
    let _ = unsafe { EMITTED_STACKS.insert(&hash, &1, 0) };
    Some(hash)
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
