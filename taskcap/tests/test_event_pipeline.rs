//! End-to-end test of the userspace output pipeline: synthetic ring-buffer
//! records in, CSV files out. Checks the correlation invariants downstream
//! SQL relies on.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use taskcap::output::OutputFiles;
use taskcap::sampling::{EventProcessor, OutputMode};
use taskcap::symbolize::KernelSymbols;
use taskcap::timebase::TimeBase;
use taskcap_common::{
    StackEvent, SyscallCompletion, TaskSample, EVENT_SYSCALL_COMPLETION,
};

fn bytes_of<T>(rec: &T) -> &[u8] {
    // SAFETY: all records are repr(C) Pod types
    #[allow(unsafe_code)]
    unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(rec).cast::<u8>(), std::mem::size_of::<T>())
    }
}

fn processor_into(dir: &Path) -> EventProcessor {
    let files = OutputFiles::create(dir).unwrap();
    EventProcessor::new(OutputMode::Csv(files), 1_000_000, KernelSymbols::parse(""))
}

fn sample(tid: u32, ktime: u64, seq: u64, kstack: u64) -> TaskSample {
    let mut rec = TaskSample::zeroed();
    rec.tid = tid;
    rec.tgid = tid;
    rec.sample_start_ktime = ktime;
    rec.sample_actual_ktime = ktime;
    rec.sc_sequence_num = seq;
    rec.syscall_nr = 0;
    rec.active_syscall_nr = 0;
    rec.kstack_hash = kstack;
    rec.comm[..4].copy_from_slice(b"test");
    rec
}

fn read_rows(path: &Path) -> Vec<String> {
    fs::read_to_string(path).unwrap().lines().skip(1).map(ToString::to_string).collect()
}

fn only_file_with_prefix(dir: &Path, prefix: &str) -> std::path::PathBuf {
    let mut found: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(prefix))
        .collect();
    assert_eq!(found.len(), 1, "expected one {prefix} file");
    found.pop().unwrap()
}

#[test]
fn samples_and_completions_join_on_tid_and_seq() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = processor_into(dir.path());
    p.begin_tick(TimeBase::fixed(1_700_000_000_000_000, 0));

    // three ticks observe the same syscall (same seq), then it completes
    for i in 0..3u64 {
        let rec = sample(100, 1_000_000_000 * (i + 1), 7, 0);
        p.handle_sample(bytes_of(&rec)).unwrap();
    }
    let done = SyscallCompletion {
        kind: EVENT_SYSCALL_COMPLETION,
        tid: 100,
        tgid: 100,
        syscall_nr: 0,
        enter_time: 900_000_000,
        exit_time: 3_900_000_000,
        sc_sequence_num: 7,
        ret: 4096,
    };
    p.handle_completion(bytes_of(&done)).unwrap();
    p.end_tick().unwrap();

    let samples = read_rows(&only_file_with_prefix(dir.path(), "samples_"));
    assert_eq!(samples.len(), 3);
    // SYSC_SEQ_NUM is the 15th field of a sample row (0-based 14)
    for row in &samples {
        assert_eq!(row.split(',').nth(14).unwrap(), "7");
        assert_eq!(row.split(',').nth(2).unwrap(), "100");
    }

    let completions = read_rows(&only_file_with_prefix(dir.path(), "sc_completion_"));
    assert_eq!(completions.len(), 1, "exactly one completion per sampled syscall");
    let fields: Vec<&str> = completions[0].split(',').collect();
    assert_eq!(fields[1], "100"); // TID
    assert_eq!(fields[6], "7"); // SYSC_SEQ_NUM joins the samples
    assert_eq!(fields[4], "3000000000"); // DURATION_NS
}

#[test]
fn stack_rows_are_unique_and_referenced_hashes_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = processor_into(dir.path());
    p.begin_tick(TimeBase::fixed(1_700_000_000_000_000, 0));

    let mut stack = StackEvent::zeroed();
    stack.hash = 0xabcd;
    stack.kernel = 1;
    stack.depth = 2;
    stack.addrs[0] = 0xffff_8000_0000_1000;
    stack.addrs[1] = 0xffff_8000_0000_2000;

    // kernel may re-emit after emitted-set eviction; the file must not
    p.handle_stack(bytes_of(&stack)).unwrap();
    p.handle_stack(bytes_of(&stack)).unwrap();

    // two tasks share the stack
    p.handle_sample(bytes_of(&sample(1, 1_000, 1, 0xabcd))).unwrap();
    p.handle_sample(bytes_of(&sample(2, 1_000, 1, 0xabcd))).unwrap();
    p.end_tick().unwrap();

    let stacks = read_rows(&only_file_with_prefix(dir.path(), "kstacks_"));
    assert_eq!(stacks.len(), 1, "one row per unique hash");
    assert!(stacks[0].starts_with("abcd,"));

    // every referenced hash exists in the stacks file
    let known: HashSet<&str> = stacks.iter().map(|r| r.split(',').next().unwrap()).collect();
    for row in read_rows(&only_file_with_prefix(dir.path(), "samples_")) {
        let kstack = row.split(',').nth(26).unwrap();
        assert!(known.contains(kstack));
    }
}

#[test]
fn rows_split_at_hour_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = processor_into(dir.path());
    p.begin_tick(TimeBase::fixed(1_700_000_000_000_000, 0));

    // two samples 61 minutes apart land in different hourly files
    p.handle_sample(bytes_of(&sample(1, 0, 1, 0))).unwrap();
    p.handle_sample(bytes_of(&sample(1, 61 * 60 * 1_000_000_000, 2, 0))).unwrap();
    p.end_tick().unwrap();

    let files: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("samples_"))
        .collect();
    assert_eq!(files.len(), 2, "hour boundary opens a second file");
    for f in files {
        let content = fs::read_to_string(f).unwrap();
        assert!(content.starts_with("TIMESTAMP,"), "each file carries its own header");
        assert_eq!(content.lines().count(), 2); // header + one row
    }
}

#[test]
fn malformed_records_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = processor_into(dir.path());
    p.begin_tick(TimeBase::fixed(0, 0));

    p.handle_sample(&[0u8; 3]).unwrap();
    p.handle_completion(&[0u8; 2]).unwrap();
    // unknown completion kind
    p.handle_completion(&999u32.to_ne_bytes()).unwrap();
    p.end_tick().unwrap();

    assert_eq!(p.stats.malformed, 3);
    assert_eq!(p.stats.samples, 0);
}

#[test]
fn human_mode_prints_selected_columns_and_stacks_once() {
    use taskcap::output::columns::parse_selection;

    let out: Vec<u8> = Vec::new();
    let mut p = EventProcessor::new(
        OutputMode::Human {
            out: Box::new(out),
            columns: parse_selection("tid,state,syscall").unwrap(),
            print_stacks: true,
            header_written: false,
        },
        1_000_000,
        KernelSymbols::parse("ffffffff81000000 T vfs_read\n"),
    );
    p.begin_tick(TimeBase::fixed(0, 0));

    let mut stack = StackEvent::zeroed();
    stack.hash = 0xbeef;
    stack.kernel = 1;
    stack.depth = 1;
    stack.addrs[0] = 0xffff_ffff_8100_0010;
    p.handle_stack(bytes_of(&stack)).unwrap();

    p.handle_sample(bytes_of(&sample(5, 1_000, 1, 0xbeef))).unwrap();
    p.handle_sample(bytes_of(&sample(6, 1_000, 1, 0xbeef))).unwrap();
    p.end_tick().unwrap();

    assert_eq!(p.stats.samples, 2);
    assert_eq!(p.stats.kstacks, 1);
}
