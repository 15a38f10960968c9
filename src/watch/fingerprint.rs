//! Watch fingerprints.
//!
//! A fingerprint identifies a watched query: the command name plus its
//! arguments in canonical form. Two commands that always produce the same
//! result share a fingerprint, so their subscribers share one
//! re-evaluation.

use crate::engine::Command;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// How a command's arguments are canonicalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArgOrder {
    /// Argument order matters
    #[default]
    Ordered,
    /// Arguments from this index on can be reordered without changing the
    /// result, so they are sorted before hashing
    UnorderedFrom(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn of(command: &Command, order: ArgOrder) -> Self {
        let mut hasher = DefaultHasher::new();
        command.name.hash(&mut hasher);

        match order {
            ArgOrder::Ordered => command.args.hash(&mut hasher),
            ArgOrder::UnorderedFrom(start) => {
                let split = start.min(command.args.len());
                let (fixed, rest) = command.args.split_at(split);
                let mut rest: Vec<_> = rest.iter().collect();
                rest.sort_unstable();
                fixed.hash(&mut hasher);
                rest.hash(&mut hasher);
            }
        }

        Fingerprint(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Fingerprint)
    }
}
