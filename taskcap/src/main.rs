// The main loop is intentionally one function: trigger, drain, write, sleep
#![allow(clippy::too_many_lines)]

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

use taskcap::cli::Args;
use taskcap::output::columns::{append_selection, parse_selection};
use taskcap::output::OutputFiles;
use taskcap::sampling::{
    attach_iorq_tracker, attach_syscall_tracker, init_ebpf_logger, load_ebpf, load_sampler,
    pin_maps, populate_config, run_sampler_sweep, EventProcessor, OutputMode,
};
use taskcap::symbolize::KernelSymbols;
use taskcap::timebase::TimeBase;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    // Refuse bad column input before touching the kernel
    let mut columns = parse_selection(&args.columns)?;
    if let Some(extra) = &args.append_columns {
        if args.output_dir.is_some() {
            warn!("--append-columns is ignored in CSV mode (all columns are always written)");
        } else {
            columns = append_selection(columns, extra)?;
        }
    }

    let track = args.track_modes();
    let freq = args.freq.max(1);
    let tick = Duration::from_secs(1) / freq;
    let weight_us = u64::from(1_000_000 / freq);

    // Load the eBPF object and establish the load-time parameters
    let mut bpf = load_ebpf().context("Failed to load eBPF object")?;
    init_ebpf_logger(&mut bpf);
    populate_config(
        &mut bpf,
        args.show_all,
        args.pidfilter.unwrap_or(0),
        args.daemon_port,
        args.kstacks(),
        args.ustacks,
    )?;
    if let Some(dir) = &args.pin_dir {
        pin_maps(&mut bpf, dir);
    }

    // The sampler is always on; trackers only when requested
    load_sampler(&mut bpf)?;
    if track.syscall {
        attach_syscall_tracker(&mut bpf)?;
        info!("syscall completion tracking on");
    }
    if track.iorq {
        attach_iorq_tracker(&mut bpf)?;
        info!("block-I/O completion tracking on");
    }

    let mut sample_ring =
        RingBuf::try_from(bpf.take_map("SAMPLES").context("SAMPLES map not found")?)?;
    let mut stack_ring = RingBuf::try_from(bpf.take_map("STACKS").context("STACKS map not found")?)?;
    let mut completion_ring =
        RingBuf::try_from(bpf.take_map("COMPLETIONS").context("COMPLETIONS map not found")?)?;

    let ksyms = if args.kstacks() {
        KernelSymbols::load().unwrap_or_else(|e| {
            warn!("kernel stacks will stay unsymbolized: {e:#}");
            KernelSymbols::parse("")
        })
    } else {
        KernelSymbols::parse("")
    };

    let mode = match &args.output_dir {
        Some(dir) => {
            info!("writing hourly CSV files under {}", dir.display());
            OutputMode::Csv(OutputFiles::create(dir)?)
        }
        None => OutputMode::Human {
            out: Box::new(std::io::stdout()),
            columns,
            print_stacks: args.kstacks() || args.ustacks,
            header_written: false,
        },
    };
    let mut processor = EventProcessor::new(mode, weight_us, ksyms);

    let mut sigterm = signal(SignalKind::terminate())?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("sampling at {freq} Hz");
    let mut ticks: u64 = 0;
    let mut stats_timer = Instant::now();

    loop {
        let tick_started = Instant::now();

        // One wall/monotonic pair is the timestamp basis for this whole tick
        processor.begin_tick(TimeBase::now());

        // Trigger the task iterator; returns after the sweep has pushed
        // every selected task into the sample ring
        run_sampler_sweep(&mut bpf)?;

        // Stacks first, so a hash is on disk before the samples that
        // reference it; everything is non-blocking, leftovers wait a tick
        while let Some(item) = stack_ring.next() {
            processor.handle_stack(&item)?;
        }
        while let Some(item) = sample_ring.next() {
            processor.handle_sample(&item)?;
        }
        while let Some(item) = completion_ring.next() {
            processor.handle_completion(&item)?;
        }

        processor.end_tick()?;

        ticks += 1;
        if args.iterations > 0 && ticks >= args.iterations {
            info!("iteration cap reached ({ticks} ticks)");
            break;
        }

        if stats_timer.elapsed() > Duration::from_secs(10) {
            debug!("{:?}", processor.stats);
            stats_timer = Instant::now();
        }

        let elapsed = tick_started.elapsed();
        let remaining = tick.saturating_sub(elapsed);
        if remaining.is_zero() {
            warn!("tick overran: {elapsed:?} > {tick:?}, skipping sleep");
        }
        tokio::select! {
            () = tokio::time::sleep(remaining) => {}
            _ = &mut ctrl_c => {
                info!("interrupted, shutting down after {ticks} ticks");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated, shutting down after {ticks} ticks");
                break;
            }
        }
    }

    // Drain what the last sweep left behind, then flush everything
    while let Some(item) = stack_ring.next() {
        processor.handle_stack(&item)?;
    }
    while let Some(item) = sample_ring.next() {
        processor.handle_sample(&item)?;
    }
    while let Some(item) = completion_ring.next() {
        processor.handle_completion(&item)?;
    }
    processor.end_tick()?;
    debug!("{:?}", processor.stats);

    Ok(())
}
