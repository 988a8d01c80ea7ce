//! Kernel structure field readers.
//!
//! The task iterator walks raw kernel structures with bounded
//! `bpf_probe_read_kernel` chains. Field offsets below were extracted with
//! pahole from the target kernel's BTF; regenerate them when moving to a
//! kernel with a different struct layout. A misread fails closed: every
//! reader returns a neutral value instead of erroring out of the sweep.

#![allow(clippy::cast_possible_truncation)]

use aya_ebpf::cty::c_void;
use aya_ebpf::helpers::gen::bpf_copy_from_user_task;
use aya_ebpf::helpers::{bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes};
use taskcap_common::{ConnInfo, EXE_NAME_LEN, FILENAME_LEN, TASK_COMM_LEN};

/// kthread flag in task_struct.flags
pub const PF_KTHREAD: u32 = 0x0020_0000;

// task_struct, pahole output for 6.8 x86_64 defconfig
mod task {
    pub const STATE: usize = 0x18; // __state (renamed from `state` in 5.14)
    pub const STACK: usize = 0x20;
    pub const FLAGS: usize = 0x2c;
    pub const ON_CPU: usize = 0x44;
    pub const ON_RQ: usize = 0x60;
    pub const MIGRATION_PENDING: usize = 0x9b8;
    pub const MM: usize = 0x920;
    pub const PID: usize = 0x998;
    pub const TGID: usize = 0x99c;
    pub const NVCSW: usize = 0xa28;
    pub const NIVCSW: usize = 0xa30;
    pub const CRED: usize = 0xad8;
    pub const COMM: usize = 0xae8;
    pub const FILES: usize = 0xb58;
    pub const NSPROXY: usize = 0xb68;
    pub const CGROUPS: usize = 0xc28;
}

mod cred {
    pub const EUID: usize = 0x14;
}

mod mm {
    pub const EXE_FILE: usize = 0x3a0;
}

mod files {
    pub const FDT: usize = 0x20; // files_struct.fdt
}

mod fdtable {
    pub const MAX_FDS: usize = 0x0;
    pub const FD: usize = 0x8; // struct file **fd
}

mod file {
    pub const F_PATH_DENTRY: usize = 0x18; // f_path.dentry
    pub const F_INODE: usize = 0x20;
    pub const PRIVATE_DATA: usize = 0xc0;
}

mod dentry {
    pub const D_NAME_NAME: usize = 0x28; // d_name.name (qstr char *)
}

mod inode {
    pub const I_MODE: usize = 0x0; // umode_t
}

mod socket {
    pub const SK: usize = 0x18; // socket.sk
}

// sock_common sits at the head of struct sock
mod sk {
    pub const DADDR: usize = 0x0;
    pub const RCV_SADDR: usize = 0x4;
    pub const DPORT: usize = 0xc; // __be16
    pub const NUM: usize = 0xe; // local port, host order
    pub const FAMILY: usize = 0x10;
    pub const STATE: usize = 0x12;
    pub const V6_DADDR: usize = 0x38;
    pub const V6_RCV_SADDR: usize = 0x48;
    pub const PROTOCOL: usize = 0x2fa; // sk_protocol bitfield byte
}

mod nsproxy {
    pub const PID_NS_FOR_CHILDREN: usize = 0x28;
}

mod ns_common {
    pub const INUM: usize = 0x10;
}

mod css_set {
    pub const DFL_CGRP: usize = 0x50;
}

mod cgroup {
    pub const KN: usize = 0x88;
}

mod kernfs_node {
    pub const ID: usize = 0x68;
}

// io_uring: io_ring_ctx -> io_rings; the rings live in kernel memory
// mapped into the submitter, struct io_uring heads/tails are
// cacheline-aligned pairs
mod uring {
    pub const CTX_RINGS: usize = 0x48; // io_ring_ctx.rings
    pub const CTX_SQ_SQES: usize = 0x58; // io_ring_ctx.sq_sqes
    pub const CTX_SQ_MASK: usize = 0x104; // sq_entries - 1 lives next to it
    pub const SQ_HEAD: usize = 0x0;
    pub const SQ_TAIL: usize = 0x40;
    pub const CQ_HEAD: usize = 0x80;
    pub const CQ_TAIL: usize = 0xc0;
    pub const SQE_OPCODE: usize = 0x0;
    pub const SQE_FD: usize = 0x4;
    pub const SQE_OFF: usize = 0x8;
    pub const SQE_LEN: usize = 0x18;
    pub const SQE_SIZE: usize = 64;
}

// struct aio_ring header, lives in user memory of the submitter
mod aio_ring {
    pub const NR: usize = 0x4;
    pub const HEAD: usize = 0x8;
    pub const TAIL: usize = 0xc;
}

// struct request (block layer)
mod request {
    pub const RQ_DISK_PART: usize = 0x30; // part -> block_device
    pub const CMD_FLAGS: usize = 0x18;
    pub const DATA_LEN: usize = 0x28; // __data_len
    pub const SECTOR: usize = 0x48; // __sector
}

mod block_device {
    pub const BD_DEV: usize = 0x0;
}

#[inline(always)]
unsafe fn read<T>(base: *const u8, off: usize) -> Option<T> {
    if base.is_null() {
        return None;
    }
    bpf_probe_read_kernel(base.add(off).cast::<T>()).ok()
}

#[inline(always)]
unsafe fn read_ptr(base: *const u8, off: usize) -> Option<*const u8> {
    let ptr: u64 = read(base, off)?;
    if ptr == 0 {
        None
    } else {
        Some(ptr as *const u8)
    }
}

pub unsafe fn task_state(task: *const u8) -> u32 {
    read(task, task::STATE).unwrap_or(0)
}

pub unsafe fn task_flags(task: *const u8) -> u32 {
    read(task, task::FLAGS).unwrap_or(0)
}

pub unsafe fn task_is_kthread(task: *const u8) -> bool {
    task_flags(task) & PF_KTHREAD != 0
}

pub unsafe fn task_pid(task: *const u8) -> u32 {
    read(task, task::PID).unwrap_or(0)
}

pub unsafe fn task_tgid(task: *const u8) -> u32 {
    read(task, task::TGID).unwrap_or(0)
}

pub unsafe fn task_on_cpu(task: *const u8) -> bool {
    read::<u32>(task, task::ON_CPU).unwrap_or(0) != 0
}

pub unsafe fn task_on_rq(task: *const u8) -> bool {
    read::<u32>(task, task::ON_RQ).unwrap_or(0) != 0
}

pub unsafe fn task_migration_pending(task: *const u8) -> bool {
    read::<u64>(task, task::MIGRATION_PENDING).unwrap_or(0) != 0
}

/// Voluntary + involuntary context switches, the stack-cache validity key.
pub unsafe fn task_csw_count(task: *const u8) -> u64 {
    let nvcsw: u64 = read(task, task::NVCSW).unwrap_or(0);
    let nivcsw: u64 = read(task, task::NIVCSW).unwrap_or(0);
    nvcsw.wrapping_add(nivcsw)
}

pub unsafe fn task_euid(task: *const u8) -> u32 {
    read_ptr(task, task::CRED).and_then(|cred| read(cred, cred::EUID)).unwrap_or(0)
}

pub unsafe fn task_comm(task: *const u8, out: &mut [u8; TASK_COMM_LEN]) {
    if let Some(comm) = read::<[u8; TASK_COMM_LEN]>(task, task::COMM) {
        *out = comm;
    }
}

pub unsafe fn task_pidns_inum(task: *const u8) -> u32 {
    read_ptr(task, task::NSPROXY)
        .and_then(|ns| read_ptr(ns, nsproxy::PID_NS_FOR_CHILDREN))
        .and_then(|pidns| read(pidns, ns_common::INUM))
        .unwrap_or(0)
}

pub unsafe fn task_cgroup_id(task: *const u8) -> u64 {
    read_ptr(task, task::CGROUPS)
        .and_then(|css| read_ptr(css, css_set::DFL_CGRP))
        .and_then(|cgrp| read_ptr(cgrp, cgroup::KN))
        .and_then(|kn| read(kn, kernfs_node::ID))
        .unwrap_or(0)
}

/// Basename of the executable, empty for kernel threads.
pub unsafe fn task_exe_basename(task: *const u8, out: &mut [u8; EXE_NAME_LEN]) {
    let name = read_ptr(task, task::MM)
        .and_then(|mm| read_ptr(mm, mm::EXE_FILE))
        .and_then(|exe| read_ptr(exe, file::F_PATH_DENTRY))
        .and_then(|dentry| read_ptr(dentry, dentry::D_NAME_NAME));
    if let Some(name) = name {
        let _ = bpf_probe_read_kernel_str_bytes(name, out);
    }
}

/// Look up `fd` in the task's file table.
pub unsafe fn task_file(task: *const u8, fd: i32) -> Option<*const u8> {
    if fd < 0 {
        return None;
    }
    let files = read_ptr(task, task::FILES)?;
    let fdt = read_ptr(files, files::FDT)?;
    let max_fds: u32 = read(fdt, fdtable::MAX_FDS)?;
    if fd as u32 >= max_fds {
        return None;
    }
    let fd_array = read_ptr(fdt, fdtable::FD)?;
    read_ptr(fd_array, fd as usize * 8)
}

const S_IFMT: u16 = 0o170_000;
const S_IFSOCK: u16 = 0o140_000;

pub unsafe fn file_is_socket(f: *const u8) -> bool {
    read_ptr(f, file::F_INODE)
        .and_then(|inode| read::<u16>(inode, inode::I_MODE))
        .is_some_and(|mode| mode & S_IFMT == S_IFSOCK)
}

/// Dentry basename of an open file; anonymous inodes come out as their
/// bracketed class name (`[io_uring]`, `[eventpoll]`, ...).
pub unsafe fn file_basename(f: *const u8, out: &mut [u8; FILENAME_LEN]) {
    let name = read_ptr(f, file::F_PATH_DENTRY)
        .and_then(|dentry| read_ptr(dentry, dentry::D_NAME_NAME));
    if let Some(name) = name {
        let _ = bpf_probe_read_kernel_str_bytes(name, out);
    }
}

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// Endpoint snapshot of a socket-backed file.
pub unsafe fn socket_conn_info(f: *const u8) -> ConnInfo {
    let mut conn = ConnInfo::default();
    let Some(sock) = read_ptr(f, file::PRIVATE_DATA) else {
        return conn;
    };
    let Some(sk) = read_ptr(sock, socket::SK) else {
        return conn;
    };
    let family: u16 = read(sk, sk::FAMILY).unwrap_or(0);
    if family != AF_INET && family != AF_INET6 {
        return conn;
    }
    conn.family = family;
    conn.protocol = read(sk, sk::PROTOCOL).unwrap_or(0);
    conn.tcp_state = read(sk, sk::STATE).unwrap_or(0);
    conn.local_port = read(sk, sk::NUM).unwrap_or(0);
    conn.remote_port = u16::from_be(read(sk, sk::DPORT).unwrap_or(0));
    if family == AF_INET {
        let saddr: [u8; 4] = read(sk, sk::RCV_SADDR).unwrap_or([0; 4]);
        let daddr: [u8; 4] = read(sk, sk::DADDR).unwrap_or([0; 4]);
        conn.local_addr[..4].copy_from_slice(&saddr);
        conn.remote_addr[..4].copy_from_slice(&daddr);
    } else {
        conn.local_addr = read(sk, sk::V6_RCV_SADDR).unwrap_or([0; 16]);
        conn.remote_addr = read(sk, sk::V6_DADDR).unwrap_or([0; 16]);
    }
    conn
}

/// SQ/CQ occupancy of an io_uring file plus the most recently produced
/// SQE's opcode/fd/offset/length.
pub struct UringSnapshot {
    pub sq_pending: u32,
    pub cq_pending: u32,
    pub opcode: u8,
    pub sqe_fd: i32,
    pub offset: u64,
    pub len: u32,
}

pub unsafe fn uring_snapshot(f: *const u8) -> Option<UringSnapshot> {
    let ctx = read_ptr(f, file::PRIVATE_DATA)?;
    let rings = read_ptr(ctx, uring::CTX_RINGS)?;
    let sq_head: u32 = read(rings, uring::SQ_HEAD)?;
    let sq_tail: u32 = read(rings, uring::SQ_TAIL)?;
    let cq_head: u32 = read(rings, uring::CQ_HEAD)?;
    let cq_tail: u32 = read(rings, uring::CQ_TAIL)?;

    let mut snap = UringSnapshot {
        sq_pending: sq_tail.wrapping_sub(sq_head),
        cq_pending: cq_tail.wrapping_sub(cq_head),
        opcode: 0,
        sqe_fd: -1,
        offset: 0,
        len: 0,
    };

    // inspect the last produced SQE, if any
    if sq_tail != 0 {
        if let (Some(sqes), Some(mask)) = (
            read_ptr(ctx, uring::CTX_SQ_SQES),
            read::<u32>(ctx, uring::CTX_SQ_MASK),
        ) {
            let idx = sq_tail.wrapping_sub(1) & mask;
            let sqe = sqes.add(idx as usize * uring::SQE_SIZE);
            snap.opcode = read(sqe, uring::SQE_OPCODE).unwrap_or(0);
            snap.sqe_fd = read(sqe, uring::SQE_FD).unwrap_or(-1);
            snap.offset = read(sqe, uring::SQE_OFF).unwrap_or(0);
            snap.len = read(sqe, uring::SQE_LEN).unwrap_or(0);
        }
    }
    Some(snap)
}

/// AIO inflight count from the ring header at `ring_user_ptr` inside
/// `task`'s address space. Needs the sleepable iterator.
pub unsafe fn aio_inflight(task: *const u8, ring_user_ptr: u64) -> u32 {
    if ring_user_ptr == 0 {
        return 0;
    }
    let mut hdr = [0u8; 16];
    let rc = bpf_copy_from_user_task(
        hdr.as_mut_ptr().cast::<c_void>(),
        hdr.len() as u32,
        ring_user_ptr as *const c_void,
        task as *mut c_void,
        0,
    );
    if rc != 0 {
        return 0;
    }
    let nr = ring_u32(&hdr, aio_ring::NR);
    let head = ring_u32(&hdr, aio_ring::HEAD);
    let tail = ring_u32(&hdr, aio_ring::TAIL);
    if nr == 0 {
        return 0;
    }
    tail.wrapping_sub(head) % nr
}

#[inline(always)]
fn ring_u32(hdr: &[u8; 16], off: usize) -> u32 {
    u32::from_ne_bytes([hdr[off], hdr[off + 1], hdr[off + 2], hdr[off + 3]])
}

/// First fd of a poll/select wait: the leading pollfd in the user array.
pub unsafe fn poll_first_fd(task: *const u8, pollfds_user_ptr: u64) -> i32 {
    if pollfds_user_ptr == 0 {
        return -1;
    }
    let mut fd_bytes = [0u8; 4];
    let rc = bpf_copy_from_user_task(
        fd_bytes.as_mut_ptr().cast::<c_void>(),
        4,
        pollfds_user_ptr as *const c_void,
        task as *mut c_void,
        0,
    );
    if rc != 0 {
        return -1;
    }
    i32::from_ne_bytes(fd_bytes)
}

/// `(dev, sector, bytes, cmd_flags)` of a block request.
pub unsafe fn request_fields(rq: *const u8) -> (u32, u64, u32, u32) {
    let dev = read_ptr(rq, request::RQ_DISK_PART)
        .and_then(|part| read(part, block_device::BD_DEV))
        .unwrap_or(0);
    let sector: u64 = read(rq, request::SECTOR).unwrap_or(0);
    let bytes: u32 = read(rq, request::DATA_LEN).unwrap_or(0);
    let cmd_flags: u32 = read(rq, request::CMD_FLAGS).unwrap_or(0);
    (dev, sector, bytes, cmd_flags)
}

/// Kernel stack pointer base, used only as a null check before taking a
/// stack snapshot of a task that never ran.
pub unsafe fn task_stack_ptr(task: *const u8) -> Option<*const u8> {
    read_ptr(task, task::STACK)
}
