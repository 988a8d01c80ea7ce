//! Saved-register extraction.
//!
//! A task blocked in a syscall keeps its entry registers in the pt_regs
//! frame that `bpf_task_pt_regs()` hands us. Which register holds what is
//! the only architecture-specific part of the sampler; everything else is
//! arch-neutral.

use aya_ebpf::helpers::bpf_probe_read_kernel;

#[cfg(bpf_target_arch = "x86_64")]
mod regs {
    // field offsets into struct pt_regs, arch/x86/include/asm/ptrace.h
    pub const R10: usize = 0x38;
    pub const R9: usize = 0x40;
    pub const R8: usize = 0x48;
    pub const RDX: usize = 0x60;
    pub const RSI: usize = 0x68;
    pub const RDI: usize = 0x70;
    pub const ORIG_RAX: usize = 0x78;

    pub const ARG_OFFSETS: [usize; 6] = [RDI, RSI, RDX, R10, R8, R9];
    pub const SYSCALL_NR: usize = ORIG_RAX;
}

#[cfg(bpf_target_arch = "aarch64")]
mod regs {
    // struct pt_regs, arch/arm64/include/asm/ptrace.h: regs[31], sp, pc,
    // pstate, then orig_x0 and syscallno
    pub const fn x(n: usize) -> usize {
        n * 8
    }
    pub const ORIG_X0: usize = 34 * 8;
    pub const SYSCALLNO: usize = 35 * 8;

    pub const ARG_OFFSETS: [usize; 6] = [ORIG_X0, x(1), x(2), x(3), x(4), x(5)];
    pub const SYSCALL_NR: usize = SYSCALLNO;
}

/// Syscall number from a saved register frame, -1 when the task is not in
/// a syscall (the kernel parks that sentinel in the nr slot on both
/// supported architectures).
///
/// # Safety
/// `pt_regs` must point at a task's saved register frame.
pub unsafe fn syscall_nr(pt_regs: *const u8) -> i64 {
    #[cfg(bpf_target_arch = "x86_64")]
    {
        bpf_probe_read_kernel(pt_regs.add(regs::SYSCALL_NR).cast::<i64>()).unwrap_or(-1)
    }
    #[cfg(bpf_target_arch = "aarch64")]
    {
        i64::from(bpf_probe_read_kernel(pt_regs.add(regs::SYSCALL_NR).cast::<i32>()).unwrap_or(-1))
    }
    #[cfg(not(any(bpf_target_arch = "x86_64", bpf_target_arch = "aarch64")))]
    {
        let _ = pt_regs;
        -1
    }
}

/// The six syscall argument registers.
///
/// # Safety
/// `pt_regs` must point at a task's saved register frame.
pub unsafe fn syscall_args(pt_regs: *const u8, out: &mut [u64; 6]) {
    #[cfg(any(bpf_target_arch = "x86_64", bpf_target_arch = "aarch64"))]
    for (slot, off) in out.iter_mut().zip(regs::ARG_OFFSETS) {
        *slot = bpf_probe_read_kernel(pt_regs.add(off).cast::<u64>()).unwrap_or(0);
    }
    #[cfg(not(any(bpf_target_arch = "x86_64", bpf_target_arch = "aarch64")))]
    {
        let _ = pt_regs;
        out.fill(0);
    }
}
