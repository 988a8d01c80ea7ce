//! The column table.
//!
//! A closed set of columns, each a `(name, header, signed width, formatter)`
//! tuple; negative width means left-aligned. CSV mode ignores the user's
//! selection and always writes every column in table order so the file
//! format stays stable for downstream SQL; the selection only shapes the
//! human-readable output.

use crate::domain::ColumnError;
use crate::output::rows::{csv_text, SampleRow};

pub type ColumnFn = fn(&SampleRow) -> String;

pub struct ColumnSpec {
    pub name: &'static str,
    pub header: &'static str,
    pub width: i32,
    /// Quote in CSV mode (field may contain commas).
    pub quote: bool,
    pub format: ColumnFn,
}

/// All columns, in the fixed CSV order of `SAMPLES_HEADER`.
pub static COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        name: "timestamp",
        header: "TIMESTAMP",
        width: -26,
        quote: false,
        format: |r| r.timestamp.clone(),
    },
    ColumnSpec {
        name: "weight_us",
        header: "WEIGHT_US",
        width: 9,
        quote: false,
        format: |r| r.weight_us.to_string(),
    },
    ColumnSpec { name: "tid", header: "TID", width: 7, quote: false, format: |r| r.tid.to_string() },
    ColumnSpec {
        name: "tgid",
        header: "TGID",
        width: 7,
        quote: false,
        format: |r| r.tgid.to_string(),
    },
    ColumnSpec {
        name: "pidns",
        header: "PIDNS",
        width: 10,
        quote: false,
        format: |r| r.pidns.to_string(),
    },
    ColumnSpec {
        name: "cgroup_id",
        header: "CGROUP_ID",
        width: 16,
        quote: false,
        format: |r| r.cgroup_id.to_string(),
    },
    ColumnSpec {
        name: "state",
        header: "STATE",
        width: -8,
        quote: false,
        format: |r| r.state.clone(),
    },
    ColumnSpec {
        name: "username",
        header: "USERNAME",
        width: -12,
        quote: false,
        format: |r| r.username.clone(),
    },
    ColumnSpec { name: "exe", header: "EXE", width: -16, quote: true, format: |r| r.exe.clone() },
    ColumnSpec { name: "comm", header: "COMM", width: -16, quote: true, format: |r| r.comm.clone() },
    ColumnSpec {
        name: "syscall",
        header: "SYSCALL",
        width: -18,
        quote: false,
        format: |r| r.syscall.clone(),
    },
    ColumnSpec {
        name: "syscall_active",
        header: "SYSCALL_ACTIVE",
        width: -18,
        quote: false,
        format: |r| r.syscall_active.clone(),
    },
    ColumnSpec {
        name: "sysc_entry_time",
        header: "SYSC_ENTRY_TIME",
        width: -26,
        quote: false,
        format: |r| r.sysc_entry_time.clone(),
    },
    ColumnSpec {
        name: "sysc_ns_so_far",
        header: "SYSC_NS_SO_FAR",
        width: 14,
        quote: false,
        format: |r| r.sysc_ns_so_far.to_string(),
    },
    ColumnSpec {
        name: "sysc_seq_num",
        header: "SYSC_SEQ_NUM",
        width: 12,
        quote: false,
        format: |r| r.sysc_seq_num.to_string(),
    },
    ColumnSpec {
        name: "iorq_seq_num",
        header: "IORQ_SEQ_NUM",
        width: 12,
        quote: false,
        format: |r| r.iorq_seq_num.to_string(),
    },
    ColumnSpec {
        name: "sysc_arg1",
        header: "SYSC_ARG1",
        width: 12,
        quote: false,
        format: |r| format!("{:x}", r.args[0]),
    },
    ColumnSpec {
        name: "sysc_arg2",
        header: "SYSC_ARG2",
        width: 12,
        quote: false,
        format: |r| format!("{:x}", r.args[1]),
    },
    ColumnSpec {
        name: "sysc_arg3",
        header: "SYSC_ARG3",
        width: 12,
        quote: false,
        format: |r| format!("{:x}", r.args[2]),
    },
    ColumnSpec {
        name: "sysc_arg4",
        header: "SYSC_ARG4",
        width: 12,
        quote: false,
        format: |r| format!("{:x}", r.args[3]),
    },
    ColumnSpec {
        name: "sysc_arg5",
        header: "SYSC_ARG5",
        width: 12,
        quote: false,
        format: |r| format!("{:x}", r.args[4]),
    },
    ColumnSpec {
        name: "sysc_arg6",
        header: "SYSC_ARG6",
        width: 12,
        quote: false,
        format: |r| format!("{:x}", r.args[5]),
    },
    ColumnSpec {
        name: "filename",
        header: "FILENAME",
        width: -24,
        quote: true,
        format: |r| r.filename.clone(),
    },
    ColumnSpec {
        name: "connection",
        header: "CONNECTION",
        width: -44,
        quote: false,
        format: |r| r.connection.clone(),
    },
    ColumnSpec {
        name: "conn_state",
        header: "CONN_STATE",
        width: -12,
        quote: false,
        format: |r| r.conn_state.clone(),
    },
    ColumnSpec {
        name: "extra_info",
        header: "EXTRA_INFO",
        width: -32,
        quote: true,
        format: |r| r.extra_info.clone(),
    },
    ColumnSpec {
        name: "kstack_hash",
        header: "KSTACK_HASH",
        width: 16,
        quote: false,
        format: |r| format!("{:x}", r.kstack_hash),
    },
    ColumnSpec {
        name: "ustack_hash",
        header: "USTACK_HASH",
        width: 16,
        quote: false,
        format: |r| format!("{:x}", r.ustack_hash),
    },
];

const NARROW: &[&str] = &["timestamp", "tid", "state", "comm", "syscall", "filename"];

const NORMAL: &[&str] = &[
    "timestamp",
    "tid",
    "tgid",
    "state",
    "username",
    "exe",
    "comm",
    "syscall",
    "sysc_ns_so_far",
    "filename",
    "connection",
    "conn_state",
];

const WIDE: &[&str] = &[
    "timestamp",
    "weight_us",
    "tid",
    "tgid",
    "pidns",
    "cgroup_id",
    "state",
    "username",
    "exe",
    "comm",
    "syscall",
    "syscall_active",
    "sysc_entry_time",
    "sysc_ns_so_far",
    "sysc_seq_num",
    "iorq_seq_num",
    "filename",
    "connection",
    "conn_state",
    "extra_info",
    "kstack_hash",
    "ustack_hash",
];

fn find(name: &str) -> Option<&'static ColumnSpec> {
    let lower = name.trim().to_ascii_lowercase();
    COLUMNS.iter().find(|c| c.name == lower)
}

/// Parse a column selection: a predefined set name (`narrow`, `normal`,
/// `wide`, `all`) or a comma list of column names. Matching is
/// case-insensitive; duplicates are dropped.
///
/// # Errors
/// Returns `ColumnError::UnknownColumn` for a name not in the table.
pub fn parse_selection(input: &str) -> Result<Vec<&'static ColumnSpec>, ColumnError> {
    let set = match input.trim().to_ascii_lowercase().as_str() {
        "narrow" => Some(NARROW),
        "normal" => Some(NORMAL),
        "wide" => Some(WIDE),
        "all" => return Ok(COLUMNS.iter().collect()),
        _ => None,
    };
    if let Some(names) = set {
        return Ok(names.iter().map(|&n| find(n).expect("predefined set names exist")).collect());
    }

    let mut cols: Vec<&'static ColumnSpec> = Vec::new();
    for name in input.split(',') {
        if name.trim().is_empty() {
            continue;
        }
        let col = find(name).ok_or_else(|| ColumnError::UnknownColumn(name.trim().to_string()))?;
        if !cols.iter().any(|c| std::ptr::eq(*c, col)) {
            cols.push(col);
        }
    }
    Ok(cols)
}

/// Append more columns to an existing selection, dropping duplicates.
///
/// # Errors
/// Returns `ColumnError::UnknownColumn` for a name not in the table.
pub fn append_selection(
    mut cols: Vec<&'static ColumnSpec>,
    extra: &str,
) -> Result<Vec<&'static ColumnSpec>, ColumnError> {
    for col in parse_selection(extra)? {
        if !cols.iter().any(|c| std::ptr::eq(*c, col)) {
            cols.push(col);
        }
    }
    Ok(cols)
}

/// Fixed all-columns CSV row.
#[must_use]
pub fn csv_sample_row(row: &SampleRow) -> String {
    COLUMNS
        .iter()
        .map(|col| {
            let cell = (col.format)(row);
            if col.quote {
                csv_text(&cell)
            } else {
                cell
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn pad(s: &str, width: i32) -> String {
    let w = width.unsigned_abs() as usize;
    if width < 0 {
        format!("{s:<w$}")
    } else {
        format!("{s:>w$}")
    }
}

/// Header line for human-readable output.
#[must_use]
pub fn human_header(cols: &[&ColumnSpec]) -> String {
    cols.iter().map(|c| pad(c.header, c.width)).collect::<Vec<_>>().join(" ")
}

/// One human-readable row with the selected columns only.
#[must_use]
pub fn human_row(cols: &[&ColumnSpec], row: &SampleRow) -> String {
    cols.iter().map(|c| pad(&(c.format)(row), c.width)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SAMPLES_HEADER;

    #[test]
    fn table_order_matches_csv_header() {
        let from_table: Vec<&str> = COLUMNS.iter().map(|c| c.header).collect();
        let from_header: Vec<&str> = SAMPLES_HEADER.split(',').collect();
        assert_eq!(from_table, from_header);
    }

    #[test]
    fn names_are_unique_and_lowercase() {
        for (i, a) in COLUMNS.iter().enumerate() {
            assert_eq!(a.name, a.name.to_ascii_lowercase());
            for b in &COLUMNS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn predefined_sets_resolve() {
        for set in ["narrow", "normal", "wide", "all"] {
            assert!(!parse_selection(set).unwrap().is_empty());
        }
        assert_eq!(parse_selection("all").unwrap().len(), COLUMNS.len());
    }

    #[test]
    fn selection_is_case_insensitive() {
        let cols = parse_selection("TID,Comm,STATE").unwrap();
        let names: Vec<&str> = cols.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["tid", "comm", "state"]);
    }

    #[test]
    fn duplicates_are_ignored() {
        let cols = parse_selection("tid,tid,comm,TID").unwrap();
        assert_eq!(cols.len(), 2);
    }

    #[test]
    fn unknown_column_is_an_error() {
        let err = parse_selection("tid,bogus").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn append_adds_only_new_columns() {
        let cols = parse_selection("narrow").unwrap();
        let n = cols.len();
        let cols = append_selection(cols, "kstack_hash,tid").unwrap();
        assert_eq!(cols.len(), n + 1);
        assert_eq!(cols.last().unwrap().name, "kstack_hash");
    }
}
