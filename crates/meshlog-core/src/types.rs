//! Strong type definitions for meshlog.
//!
//! Identifiers and amounts are newtypes so that node ids, payer ids and
//! fees cannot be swapped at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Per-originator sequence number assigned by the originating node.
pub type SequenceId = u64;

/// Identifier of a node in the network (or a synthetic migration originator).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a node id from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Local database id of a payer row.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PayerId(pub i64);

impl fmt::Display for PayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fee amount in picodollars (1e-12 USD).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PicoDollar(pub u64);

impl PicoDollar {
    pub const ZERO: Self = Self(0);

    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Add for PicoDollar {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for PicoDollar {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl fmt::Debug for PicoDollar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PicoDollar({})", self.0)
    }
}

impl fmt::Display for PicoDollar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-byte domain separator mixed into payer report signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DomainSeparator(pub [u8; 32]);

impl DomainSeparator {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DomainSeparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainSeparator({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::new(100).to_string(), "100");
        assert_eq!(format!("{:?}", NodeId::new(7)), "NodeId(7)");
    }

    #[test]
    fn test_picodollar_add_saturates() {
        let mut fee = PicoDollar::new(u64::MAX - 1);
        fee += PicoDollar::new(10);
        assert_eq!(fee, PicoDollar::new(u64::MAX));
        assert_eq!(PicoDollar::new(2) + PicoDollar::new(3), PicoDollar::new(5));
    }
}
