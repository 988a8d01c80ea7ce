//! Structured error types for taskcap
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Failed to load eBPF object: {0}")]
    EbpfLoadFailed(String),

    #[error("Program {0} not found in eBPF object")]
    ProgramNotFound(&'static str),

    #[error("Map {0} not found in eBPF object")]
    MapNotFound(&'static str),

    #[error("Failed to attach {program} to {hook}: {error}")]
    AttachFailed { program: &'static str, hook: String, error: String },

    #[error("--passive conflicts with --track; pick one")]
    ConflictingModes,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),
}

#[derive(Error, Debug)]
pub enum ColumnError {
    #[error("Unknown column name: {0}")]
    UnknownColumn(String),

    #[error("Unknown column set: {0}")]
    UnknownSet(String),
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to create output directory {dir}: {source}")]
    DirCreateFailed { dir: String, source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_error_names_the_hook() {
        let err = SamplerError::AttachFailed {
            program: "sys_enter",
            hook: "raw_syscalls/sys_enter".to_string(),
            error: "permission denied".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("sys_enter"));
        assert!(s.contains("raw_syscalls/sys_enter"));
    }

    #[test]
    fn unknown_column_is_single_line() {
        let err = ColumnError::UnknownColumn("tidd".to_string());
        assert_eq!(err.to_string(), "Unknown column name: tidd");
    }
}
