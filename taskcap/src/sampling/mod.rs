//! Sampling core: eBPF loading/attachment and ring-buffer draining.

pub mod ebpf_setup;
pub mod event_processor;

pub use ebpf_setup::{
    attach_iorq_tracker, attach_syscall_tracker, init_ebpf_logger, load_ebpf, load_sampler,
    pin_maps, populate_config, run_sampler_sweep, TrackModes,
};
pub use event_processor::{DrainStats, EventProcessor, OutputMode};
