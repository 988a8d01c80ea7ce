//! Output pipeline: column table, row rendering, hourly-rotated CSV files.

pub mod columns;
pub mod rotate;
pub mod rows;

pub use columns::{parse_selection, ColumnSpec, COLUMNS};
pub use rotate::{HourlyWriter, OutputFiles};

/// Fixed all-columns CSV headers, one per output category. Downstream SQL
/// depends on these staying put.
pub const SAMPLES_HEADER: &str = "TIMESTAMP,WEIGHT_US,TID,TGID,PIDNS,CGROUP_ID,STATE,USERNAME,EXE,COMM,SYSCALL,SYSCALL_ACTIVE,SYSC_ENTRY_TIME,SYSC_NS_SO_FAR,SYSC_SEQ_NUM,IORQ_SEQ_NUM,SYSC_ARG1,SYSC_ARG2,SYSC_ARG3,SYSC_ARG4,SYSC_ARG5,SYSC_ARG6,FILENAME,CONNECTION,CONN_STATE,EXTRA_INFO,KSTACK_HASH,USTACK_HASH";

pub const SC_COMPLETION_HEADER: &str =
    "TYPE,TID,TGID,SYSCALL_NAME,DURATION_NS,SYSC_RET_VAL,SYSC_SEQ_NUM,SYSC_ENTER_TIME";

pub const IORQ_COMPLETION_HEADER: &str = "TYPE,INSERT_TID,INSERT_TGID,ISSUE_TID,ISSUE_TGID,COMPLETE_TID,COMPLETE_TGID,DEV_MAJ,DEV_MIN,SECTOR,BYTES,IORQ_FLAGS,IORQ_SEQ_NUM,DURATION_NS,SERVICE_NS,QUEUED_NS,ISSUE_TIMESTAMP,ERROR";

pub const KSTACKS_HEADER: &str = "KSTACK_HASH,KSTACK_SYMS";
pub const USTACKS_HEADER: &str = "USTACK_HASH,USTACK_SYMS";
pub const CGROUPS_HEADER: &str = "CGROUP_ID,CGROUP_PATH";
