//! CIDR arithmetic and the in-run address allocation record.
//!
//! The network provisioner carves public/private /24 pairs out of one /16
//! block. Candidate blocks are tried in a fixed order when the preferred
//! block collides with an address space that already exists in the account.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Ordered candidate /16 blocks for a new address space. The first block
/// that does not overlap an existing one wins.
pub const CANDIDATE_BLOCKS: &[&str] = &[
    "10.20.0.0/16",
    "10.21.0.0/16",
    "10.22.0.0/16",
    "10.23.0.0/16",
    "10.24.0.0/16",
    "172.16.0.0/16",
    "172.17.0.0/16",
    "172.18.0.0/16",
    "192.168.0.0/16",
    "10.25.0.0/16",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("malformed CIDR block '{0}'")]
    Malformed(String),
    #[error("prefix length {0} out of range")]
    PrefixOutOfRange(u8),
    #[error("block {requested} overlaps already claimed {claimed}")]
    Overlap {
        requested: CidrBlock,
        claimed: CidrBlock,
    },
}

/// An IPv4 CIDR block, stored as a masked base address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrBlock {
    base: u32,
    prefix: u8,
}

impl CidrBlock {
    pub fn new(base: u32, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::PrefixOutOfRange(prefix));
        }
        Ok(Self {
            base: base & Self::mask(prefix),
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// First address of the block.
    pub fn network(&self) -> u32 {
        self.base
    }

    /// Last address of the block.
    pub fn broadcast(&self) -> u32 {
        self.base | !Self::mask(self.prefix)
    }

    /// True when the two blocks share at least one address.
    pub fn overlaps(&self, other: &CidrBlock) -> bool {
        self.network() <= other.broadcast() && other.network() <= self.broadcast()
    }

    /// The n-th /24 inside this block. Used to lay out subnet pairs:
    /// public subnets take indices 0.., private subnets start at 10.
    pub fn nth_subnet(&self, n: u32) -> Result<CidrBlock, CidrError> {
        let base = self.base + (n << 8);
        let subnet = CidrBlock::new(base, 24)?;
        if subnet.broadcast() > self.broadcast() {
            return Err(CidrError::PrefixOutOfRange(24));
        }
        Ok(subnet)
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.base.to_be_bytes();
        write!(f, "{}.{}.{}.{}/{}", a, b, c, d, self.prefix)
    }
}

impl FromStr for CidrBlock {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CidrError::Malformed(s.to_string()))?;
        let mut octets = [0u8; 4];
        let mut parts = addr.split('.');
        for octet in &mut octets {
            *octet = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| CidrError::Malformed(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(CidrError::Malformed(s.to_string()));
        }
        CidrBlock::new(u32::from_be_bytes(octets), prefix)
    }
}

impl Serialize for CidrBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CidrBlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Tracks which ranges are already claimed inside the target address space.
///
/// Mutated only by the network provisioner, only during its own stage.
#[derive(Debug, Default, Clone)]
pub struct AddressAllocation {
    claimed: Vec<CidrBlock>,
}

impl AddressAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a block, failing if it overlaps anything already claimed.
    pub fn claim(&mut self, block: CidrBlock) -> Result<(), CidrError> {
        if let Some(existing) = self.claimed.iter().find(|c| c.overlaps(&block)) {
            return Err(CidrError::Overlap {
                requested: block,
                claimed: *existing,
            });
        }
        self.claimed.push(block);
        Ok(())
    }

    pub fn claimed(&self) -> &[CidrBlock] {
        &self.claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(s: &str) -> CidrBlock {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_roundtrip() {
        for s in CANDIDATE_BLOCKS {
            assert_eq!(block(s).to_string(), *s);
        }
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!("10.20.0.0".parse::<CidrBlock>().is_err());
        assert!("10.20.0/16".parse::<CidrBlock>().is_err());
        assert!("10.20.0.0.1/16".parse::<CidrBlock>().is_err());
        assert!("10.20.0.0/33".parse::<CidrBlock>().is_err());
    }

    #[test]
    fn test_base_is_masked() {
        let b = block("10.20.5.7/16");
        assert_eq!(b.to_string(), "10.20.0.0/16");
    }

    #[test]
    fn test_overlap_detection() {
        assert!(block("10.20.0.0/16").overlaps(&block("10.20.3.0/24")));
        assert!(!block("10.20.0.0/16").overlaps(&block("10.21.0.0/16")));
        assert!(block("10.0.0.0/8").overlaps(&block("10.24.0.0/16")));
    }

    #[test]
    fn test_nth_subnet_layout() {
        let space = block("10.20.0.0/16");
        assert_eq!(space.nth_subnet(0).unwrap().to_string(), "10.20.0.0/24");
        assert_eq!(space.nth_subnet(1).unwrap().to_string(), "10.20.1.0/24");
        assert_eq!(space.nth_subnet(10).unwrap().to_string(), "10.20.10.0/24");
        assert_eq!(space.nth_subnet(11).unwrap().to_string(), "10.20.11.0/24");
    }

    #[test]
    fn test_allocation_rejects_overlap() {
        let mut alloc = AddressAllocation::new();
        alloc.claim(block("10.20.0.0/24")).unwrap();
        alloc.claim(block("10.20.1.0/24")).unwrap();
        let err = alloc.claim(block("10.20.1.0/24")).unwrap_err();
        assert!(matches!(err, CidrError::Overlap { .. }));
    }
}
