//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::sampling::TrackModes;

#[derive(Parser)]
#[command(
    name = "taskcap",
    about = "Always-on task state sampler: what is every thread doing, and why",
    after_help = "\
EXAMPLES:
    sudo taskcap -o /var/log/taskcap           Hourly CSV files, 1 Hz
    sudo taskcap -F 20 -p 4171 -c wide         20 Hz, one process, wide columns
    sudo taskcap --passive --show-all          Samples only, no completion events
    sudo taskcap -c tid,state,syscall,filename --append-columns kstack_hash"
)]
pub struct Args {
    /// Samples per second
    #[arg(short = 'F', long, default_value = "1")]
    pub freq: u32,

    /// Sample only this thread group (TGID)
    #[arg(short = 'p', long)]
    pub pidfilter: Option<u32>,

    /// Emit every task, ignoring the filter policy
    #[arg(short = 'a', long)]
    pub show_all: bool,

    /// Passive mode: task samples only, no completion trackers
    #[arg(long, conflicts_with = "track")]
    pub passive: bool,

    /// Completion trackers to attach
    #[arg(
        short = 't',
        long,
        value_delimiter = ',',
        value_parser = ["syscall", "iorq"],
        default_values = ["syscall", "iorq"]
    )]
    pub track: Vec<String>,

    /// Local ports at or below this belong to server daemons
    #[arg(long, default_value = "10000")]
    pub daemon_port: u16,

    /// Write hourly CSV files into this directory (default: human-readable stdout)
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Columns for human output: narrow|normal|wide|all or a comma list
    #[arg(short = 'c', long, default_value = "normal")]
    pub columns: String,

    /// Extra columns appended to the selection (human mode only)
    #[arg(long, value_name = "LIST")]
    pub append_columns: Option<String>,

    /// Skip kernel stack capture
    #[arg(long)]
    pub no_kstacks: bool,

    /// Capture user stacks too (heavier: reads remote task memory)
    #[arg(long)]
    pub ustacks: bool,

    /// Stop after N ticks (0 = unlimited)
    #[arg(short = 'i', long, default_value = "0")]
    pub iterations: u64,

    /// Pin the shared maps under this bpffs directory
    #[arg(long, value_name = "DIR")]
    pub pin_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    /// Which completion trackers to attach; passive mode disables both.
    #[must_use]
    pub fn track_modes(&self) -> TrackModes {
        if self.passive {
            return TrackModes::default();
        }
        TrackModes {
            syscall: self.track.iter().any(|t| t == "syscall"),
            iorq: self.track.iter().any(|t| t == "iorq"),
        }
    }

    #[must_use]
    pub fn kstacks(&self) -> bool {
        !self.no_kstacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_track_both() {
        let args = Args::try_parse_from(["taskcap"]).unwrap();
        assert_eq!(args.track_modes(), TrackModes { syscall: true, iorq: true });
        assert_eq!(args.freq, 1);
        assert!(args.kstacks());
        assert!(!args.ustacks);
    }

    #[test]
    fn passive_disables_trackers() {
        let args = Args::try_parse_from(["taskcap", "--passive"]).unwrap();
        assert_eq!(args.track_modes(), TrackModes::default());
    }

    #[test]
    fn passive_conflicts_with_track() {
        assert!(Args::try_parse_from(["taskcap", "--passive", "-t", "syscall"]).is_err());
    }

    #[test]
    fn track_list_is_selective() {
        let args = Args::try_parse_from(["taskcap", "-t", "iorq"]).unwrap();
        assert_eq!(args.track_modes(), TrackModes { syscall: false, iorq: true });
    }
}
