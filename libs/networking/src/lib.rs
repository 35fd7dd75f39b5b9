//! Networking utilities for routed networks.
//!
//! This library provides helpers for:
//! - IPv4 address ranges (static and DHCP pools)
//! - Subnet membership derived from a gateway and netmask
//! - Pool allocation for addresses handed out to virtual machines

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid range (start after end).
    #[error("invalid address range: {0}")]
    InvalidRange(String),

    /// Invalid netmask (non-contiguous bits).
    #[error("invalid netmask: {0}")]
    InvalidNetmask(String),

    /// Two pools share at least one address.
    #[error("address pools overlap: {first} and {second}")]
    Overlap { first: Ipv4Range, second: Ipv4Range },

    /// Range lies (partly) outside the subnet.
    #[error("range {range} is outside subnet {subnet}")]
    OutsideSubnet { range: Ipv4Range, subnet: Ipv4Subnet },

    /// Address pool exhausted.
    #[error("address pool exhausted: {0}")]
    PoolExhausted(String),

    /// Address already handed out.
    #[error("address already in use: {0}")]
    InUse(Ipv4Addr),

    /// Address not covered by the pool.
    #[error("address {addr} is not in pool {pool}")]
    NotInPool { addr: Ipv4Addr, pool: String },
}

// ============================================================================
// Ranges
// ============================================================================

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Range {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl Ipv4Range {
    /// Create a new range; `start` must not come after `end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, NetworkError> {
        if u32::from(start) > u32::from(end) {
            return Err(NetworkError::InvalidRange(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Check if an address is within this range.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        u32::from(self.start) <= a && a <= u32::from(self.end)
    }

    /// Check if two ranges share at least one address.
    pub fn overlaps(&self, other: &Ipv4Range) -> bool {
        u32::from(self.start) <= u32::from(other.end)
            && u32::from(other.start) <= u32::from(self.end)
    }

    /// Iterate over every address in the range, in order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl std::fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Ensure no two ranges in the set overlap.
pub fn ensure_disjoint(ranges: &[Ipv4Range]) -> Result<(), NetworkError> {
    for (i, first) in ranges.iter().enumerate() {
        for second in &ranges[i + 1..] {
            if first.overlaps(second) {
                return Err(NetworkError::Overlap {
                    first: *first,
                    second: *second,
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// Subnets
// ============================================================================

/// IPv4 subnet derived from an address and a netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Subnet {
    /// Network address (host bits cleared).
    pub network: Ipv4Addr,

    /// Prefix length (e.g., 24 for 255.255.255.0).
    pub prefix_len: u8,
}

impl Ipv4Subnet {
    /// Build the subnet containing `addr` under `netmask`.
    pub fn from_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, NetworkError> {
        let mask = u32::from(netmask);
        // Contiguous masks have all set bits on the left.
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(NetworkError::InvalidNetmask(netmask.to_string()));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len: mask.leading_ones() as u8,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        }
    }

    /// Check if an address is within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network)
    }

    /// Check that a whole range sits inside this subnet.
    pub fn ensure_contains(&self, range: &Ipv4Range) -> Result<(), NetworkError> {
        if self.contains(range.start()) && self.contains(range.end()) {
            Ok(())
        } else {
            Err(NetworkError::OutsideSubnet {
                range: *range,
                subnet: *self,
            })
        }
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

// ============================================================================
// Pool allocation
// ============================================================================

/// Lowest-free-first allocator over one or more ranges.
#[derive(Debug, Clone)]
pub struct Ipv4PoolAllocator {
    ranges: Vec<Ipv4Range>,
    in_use: BTreeSet<Ipv4Addr>,
}

impl Ipv4PoolAllocator {
    pub fn new(ranges: Vec<Ipv4Range>) -> Self {
        Self {
            ranges,
            in_use: BTreeSet::new(),
        }
    }

    /// Check if an address is covered by any range of the pool.
    pub fn covers(&self, addr: Ipv4Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }

    /// Allocate the lowest free address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, NetworkError> {
        let free = self
            .ranges
            .iter()
            .flat_map(|r| r.iter())
            .find(|addr| !self.in_use.contains(addr));

        match free {
            Some(addr) => {
                self.in_use.insert(addr);
                Ok(addr)
            }
            None => Err(NetworkError::PoolExhausted(self.describe())),
        }
    }

    /// Claim a specific address.
    pub fn claim(&mut self, addr: Ipv4Addr) -> Result<Ipv4Addr, NetworkError> {
        if !self.covers(addr) {
            return Err(NetworkError::NotInPool {
                addr,
                pool: self.describe(),
            });
        }
        if !self.in_use.insert(addr) {
            return Err(NetworkError::InUse(addr));
        }
        Ok(addr)
    }

    /// Return an address to the pool. Returns false if it was not in use.
    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.in_use.remove(&addr)
    }

    /// Addresses currently handed out, in ascending order.
    pub fn in_use(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.in_use.iter().copied()
    }

    fn describe(&self) -> String {
        self.ranges
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}
