//! Domain model for taskcap
//!
//! Newtypes for the identifiers that would otherwise all be bare integers,
//! plus the structured error kinds.

pub mod errors;
pub mod types;

pub use errors::{ColumnError, OutputError, SamplerError};
pub use types::{StackHash, Tgid, Tid};
