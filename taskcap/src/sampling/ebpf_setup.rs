//! eBPF program loading and attachment.
//!
//! All programs live in one object file, so the maps they share (per-task
//! storage, the three rings, the iorq tracker, the emitted-stacks set) are
//! declared once and shared by colocation. The task iterator is loaded
//! once; each tick creates a short-lived iterator instance and reads it to
//! EOF, which returns only after the sweep has pushed every selected task
//! into the sample ring.

use anyhow::{Context, Result};
use aya::maps::HashMap;
use aya::programs::{Iter, RawTracePoint, TracePoint};
use aya::{Btf, Ebpf};
use aya_log::EbpfLogger;
use log::{debug, warn};
use std::io::Read;
use std::path::Path;

use taskcap_common::{
    CFG_DAEMON_PORT, CFG_FILTER_TGID, CFG_KSTACK, CFG_SELF_TGID, CFG_SHOW_ALL, CFG_USTACK,
};

/// Which completion trackers to attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackModes {
    pub syscall: bool,
    pub iorq: bool,
}

/// Environment override for the object path, mostly for packaging.
const OBJECT_PATH_ENV: &str = "TASKCAP_BPF_OBJECT";

/// Where `cargo xtask build-ebpf` leaves the object.
const DEFAULT_OBJECT_PATH: &str = "target/bpfel-unknown-none/release/taskcap";

/// Load the eBPF object binary.
///
/// The object is always the release build; debug builds pull in formatting
/// code that the BPF linker rejects, and release LTO strips dead code.
///
/// # Errors
/// Returns an error if the object file cannot be read or loaded.
pub fn load_ebpf() -> Result<Ebpf> {
    let path =
        std::env::var(OBJECT_PATH_ENV).unwrap_or_else(|_| DEFAULT_OBJECT_PATH.to_string());
    let bpf =
        Ebpf::load_file(&path).context(format!("Failed to load eBPF object from {path}"))?;
    Ok(bpf)
}

/// Initialize the kernel-side logger.
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Write the load-time parameters into the CONFIG map.
///
/// # Errors
/// Returns an error if the CONFIG map is missing or an insert fails.
pub fn populate_config(
    bpf: &mut Ebpf,
    show_all: bool,
    filter_tgid: u32,
    daemon_port: u16,
    kstacks: bool,
    ustacks: bool,
) -> Result<()> {
    let mut config: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").context("CONFIG map not found")?)?;
    config.insert(CFG_SHOW_ALL, u64::from(show_all), 0)?;
    config.insert(CFG_FILTER_TGID, u64::from(filter_tgid), 0)?;
    config.insert(CFG_DAEMON_PORT, u64::from(daemon_port), 0)?;
    config.insert(CFG_KSTACK, u64::from(kstacks), 0)?;
    config.insert(CFG_USTACK, u64::from(ustacks), 0)?;
    config.insert(CFG_SELF_TGID, u64::from(std::process::id()), 0)?;
    Ok(())
}

/// Pin the shared maps under `dir` for out-of-process inspection.
/// Pin failures are non-fatal; the maps still work unpinned.
pub fn pin_maps(bpf: &mut Ebpf, dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Failed to create pin directory {}: {e}", dir.display());
        return;
    }
    for (name, map) in bpf.maps_mut() {
        let path = dir.join(name);
        if let Err(e) = map.pin(&path) {
            warn!("Failed to pin map {name}: {e}");
        } else {
            debug!("pinned map {name} at {}", path.display());
        }
    }
}

/// Load the task-iterator program (attached per tick by
/// [`run_sampler_sweep`]).
///
/// # Errors
/// Returns an error if the program is missing or rejected by the verifier.
pub fn load_sampler(bpf: &mut Ebpf) -> Result<()> {
    let btf = Btf::from_sys_fs().context("Failed to read kernel BTF")?;
    let prog: &mut Iter =
        bpf.program_mut("sample_tasks").context("sample_tasks program not found")?.try_into()?;
    prog.load("task", &btf).context("Failed to load task iterator")?;
    Ok(())
}

/// Run one sampler sweep: create an iterator instance from the program and
/// read it to EOF. The iterator emits records on the sample ring, not into
/// the seq file, so the read mostly returns zero bytes.
///
/// # Errors
/// Returns an error if iterator creation or the read fails.
pub fn run_sampler_sweep(bpf: &mut Ebpf) -> Result<()> {
    let prog: &mut Iter =
        bpf.program_mut("sample_tasks").context("sample_tasks program not found")?.try_into()?;
    let link_id = prog.attach()?;
    let link = prog.take_link(link_id)?;
    let mut file = link.into_file()?;
    let mut sink = [0u8; 4096];
    loop {
        let n = file.read(&mut sink).context("task iterator read failed")?;
        if n == 0 {
            break;
        }
    }
    Ok(())
}

/// Attach the syscall entry/exit tracker.
///
/// # Errors
/// Returns an error if either tracepoint fails to load or attach.
pub fn attach_syscall_tracker(bpf: &mut Ebpf) -> Result<()> {
    for name in ["sys_enter", "sys_exit"] {
        let prog: &mut TracePoint =
            bpf.program_mut(name).context("syscall tracker program not found")?.try_into()?;
        prog.load()?;
        prog.attach("raw_syscalls", name)
            .context(format!("Failed to attach raw_syscalls/{name}"))?;
    }
    Ok(())
}

/// Attach the block-I/O tracker. Raw tracepoints, because only those carry
/// the request pointer that keys the tracker.
///
/// # Errors
/// Returns an error if any of the three hooks fails to load or attach.
pub fn attach_iorq_tracker(bpf: &mut Ebpf) -> Result<()> {
    for name in ["block_rq_insert", "block_rq_issue", "block_rq_complete"] {
        let prog: &mut RawTracePoint =
            bpf.program_mut(name).context("iorq tracker program not found")?.try_into()?;
        prog.load()?;
        prog.attach(name).context(format!("Failed to attach raw tracepoint {name}"))?;
    }
    Ok(())
}
