//! Tree node identifiers.
//!
//! Nodes are numbered in breadth-first order: the root is `0`, and the
//! children of a node `p` occupy `(p << dimensions) + 1 + k` for child
//! index `k` in `[0, 2^dimensions)`. Identifiers within the base zone of
//! any valid structure are guaranteed to fit a machine word; see
//! [`Id::simple`].

use std::fmt;
use std::ops::{Add, AddAssign, Shl, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{CloudtreeError, Result};

/// A tree node identifier.
///
/// Stored as a `u128`, which covers octrees through depth 42 and
/// quadtrees through depth 63; structure validation rejects depths the
/// representation cannot address.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(u128);

impl Id {
    /// The root node.
    pub const ROOT: Id = Id(0);

    pub fn new(value: u128) -> Id {
        Id(value)
    }

    pub fn value(self) -> u128 {
        self.0
    }

    /// The deepest depth addressable for a given fan-out without
    /// overflowing the representation.
    pub fn max_depth(dimensions: u32) -> u64 {
        (u128::BITS as u64 - 1) / dimensions as u64
    }

    /// The identifier of this node's child with the given index.
    pub fn child(self, dimensions: u32, index: u64) -> Result<Id> {
        let shifted = self
            .0
            .checked_shl(dimensions)
            .filter(|v| v >> dimensions == self.0)
            .ok_or(CloudtreeError::InvariantViolated("node id overflow"))?;
        shifted
            .checked_add(1 + index as u128)
            .map(Id)
            .ok_or(CloudtreeError::InvariantViolated("node id overflow"))
    }

    /// Downcast to a machine word. Guaranteed to succeed for ids within
    /// the base depth of a validated structure.
    pub fn simple(self) -> Result<u64> {
        u64::try_from(self.0)
            .map_err(|_| CloudtreeError::InvariantViolated("id does not fit a machine word"))
    }

    pub fn inc(&mut self) {
        self.0 += 1;
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Id {
        Id(value as u128)
    }
}

impl Shl<u32> for Id {
    type Output = Id;

    fn shl(self, bits: u32) -> Id {
        Id(self.0 << bits)
    }
}

impl Add for Id {
    type Output = Id;

    fn add(self, rhs: Id) -> Id {
        Id(self.0 + rhs.0)
    }
}

impl Add<u64> for Id {
    type Output = Id;

    fn add(self, rhs: u64) -> Id {
        Id(self.0 + rhs as u128)
    }
}

impl AddAssign<u64> for Id {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs as u128;
    }
}

impl Sub for Id {
    type Output = Id;

    fn sub(self, rhs: Id) -> Id {
        Id(self.0 - rhs.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
