//! CIDR block parsing and overlap checks.

use crate::error::ConfigError;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IPv4 or IPv6 network in CIDR notation with no host bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Returns the network address.
    #[must_use]
    pub const fn network(&self) -> IpAddr {
        self.network
    }

    /// Returns the prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns true if both blocks share at least one address.
    ///
    /// Blocks of different address families never overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_ipv4() != other.is_ipv4() {
            return false;
        }
        let shorter = self.prefix.min(other.prefix);
        let mask = self.mask_for(shorter);
        (self.bits() & mask) == (other.bits() & mask)
    }

    /// Returns true if the address lies inside this block.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        if self.is_ipv4() != addr.is_ipv4() {
            return false;
        }
        let mask = self.mask_for(self.prefix);
        (addr_bits(addr) & mask) == self.bits()
    }

    /// Returns true if `other` lies entirely inside this block.
    #[must_use]
    pub fn contains_cidr(&self, other: &Self) -> bool {
        other.prefix >= self.prefix && self.contains(other.network)
    }

    const fn is_ipv4(&self) -> bool {
        matches!(self.network, IpAddr::V4(_))
    }

    fn bits(&self) -> u128 {
        addr_bits(self.network)
    }

    const fn max_prefix(&self) -> u8 {
        if self.is_ipv4() { 32 } else { 128 }
    }

    fn mask_for(&self, prefix: u8) -> u128 {
        let width = u32::from(self.max_prefix());
        if prefix == 0 {
            return 0;
        }
        let ones = u128::MAX << (128 - u32::from(prefix));
        // Shift the mask down to the address width.
        ones >> (128 - width)
    }
}

fn addr_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidCidr {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected <address>/<prefix>"))?;

        let network: IpAddr = addr.parse().map_err(|_| invalid("invalid IP address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("invalid prefix length"))?;

        let cidr = Self { network, prefix };
        if prefix > cidr.max_prefix() {
            return Err(invalid("prefix length out of range"));
        }
        if cidr.bits() & !cidr.mask_for(prefix) & cidr.mask_for(cidr.max_prefix()) != 0 {
            return Err(invalid("host bits set"));
        }

        Ok(cidr)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_rejects_host_bits() {
        assert!("10.0.0.1/16".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert_eq!(cidr("10.0.0.0/16").to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_overlap() {
        assert!(cidr("10.0.0.0/16").overlaps(&cidr("10.0.4.0/24")));
        assert!(cidr("10.0.4.0/24").overlaps(&cidr("10.0.0.0/16")));
        assert!(!cidr("10.0.0.0/16").overlaps(&cidr("10.1.0.0/16")));
        assert!(cidr("0.0.0.0/0").overlaps(&cidr("192.168.0.0/24")));
        assert!(!cidr("10.0.0.0/8").overlaps(&cidr("fd00::/8")));
    }

    #[test]
    fn test_contains() {
        let services = cidr("10.96.0.0/12");
        assert!(services.contains("10.96.0.10".parse().unwrap()));
        assert!(!services.contains("10.112.0.10".parse().unwrap()));
        assert!(cidr("10.0.0.0/16").contains_cidr(&cidr("10.0.1.0/24")));
        assert!(!cidr("10.0.1.0/24").contains_cidr(&cidr("10.0.0.0/16")));
    }

    #[test]
    fn test_ipv6() {
        assert!(cidr("fd00::/64").overlaps(&cidr("fd00::/48")));
        assert!(!cidr("fd00:1::/64").overlaps(&cidr("fd00:2::/64")));
    }
}
