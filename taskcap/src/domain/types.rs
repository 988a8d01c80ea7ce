//! Core identifier newtypes.

use std::fmt;

/// Thread id, unique per thread (the kernel's `pid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

/// Thread-group id, shared by all threads of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tgid(pub u32);

/// 64-bit stack fingerprint; 0 means "no stack".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackHash(pub u64);

impl StackHash {
    #[must_use]
    pub fn is_present(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

impl fmt::Display for Tgid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TGID:{}", self.0)
    }
}

impl fmt::Display for StackHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_hash_presence() {
        assert!(!StackHash(0).is_present());
        assert!(StackHash(0xdead_beef).is_present());
    }

    #[test]
    fn stack_hash_displays_as_bare_hex() {
        assert_eq!(StackHash(0xdead_beef).to_string(), "deadbeef");
    }
}
