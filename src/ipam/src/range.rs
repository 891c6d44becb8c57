use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::error::Error;

/// Address range as it appears in configuration.
/// Unset bounds are filled in by [`Range::canonicalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub subnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<IpNet>,
}

impl Range {
    pub fn new(subnet: IpNet) -> Range {
        Range {
            subnet,
            range_start: None,
            range_end: None,
            gateway: None,
            exclude: Vec::new(),
        }
    }

    pub fn canonicalize(&self) -> Result<CanonicalRange, Error> {
        let subnet = self.subnet;
        if subnet.max_prefix_len() - subnet.prefix_len() < 2 {
            return Err(Error::SubnetTooSmall(subnet));
        }
        if subnet.trunc() != subnet {
            return Err(Error::HostBitsSet(subnet));
        }

        // The network and broadcast addresses are never handed out.
        let start = match self.range_start {
            Some(start) => {
                check_member(&start, &subnet)?;
                start
            }
            None => index_to_addr(1, &subnet),
        };
        let end = match self.range_end {
            Some(end) => {
                check_member(&end, &subnet)?;
                end
            }
            None => index_to_addr(subnet_size(&subnet) - 2, &subnet),
        };
        if addr_to_bits(&start) > addr_to_bits(&end) {
            return Err(Error::InvalidRange { start, end });
        }

        if let Some(gateway) = &self.gateway {
            check_member(gateway, &subnet)?;
        }
        for net in self.exclude.iter() {
            if net.max_prefix_len() != subnet.max_prefix_len() {
                return Err(Error::ExcludeMismatch(*net));
            }
        }

        Ok(CanonicalRange {
            subnet,
            start,
            end,
            gateway: self.gateway,
            exclude: self.exclude.clone(),
        })
    }
}

/// A validated range with both bounds resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRange {
    pub subnet: IpNet,
    pub start: IpAddr,
    pub end: IpAddr,
    pub gateway: Option<IpAddr>,
    pub exclude: Vec<IpNet>,
}

impl CanonicalRange {
    /// Identifier used to persist the scan position of this range.
    pub fn id(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        if !self.subnet.contains(addr) {
            return false;
        }
        let bits = addr_to_bits(addr);
        addr_to_bits(&self.start) <= bits && bits <= addr_to_bits(&self.end)
    }

    pub fn size(&self) -> u128 {
        addr_to_bits(&self.end) - addr_to_bits(&self.start) + 1
    }

    /// Addresses that are inside the bounds but may never be assigned.
    pub fn is_excluded(&self, addr: &IpAddr) -> bool {
        if self.gateway.as_ref() == Some(addr) {
            return true;
        }
        self.exclude.iter().any(|net| net.contains(addr))
    }

    /// Walk every address of the range exactly once, starting right after
    /// `last` and wrapping from the end back to the start.
    pub fn iter_from(&self, last: Option<IpAddr>) -> RangeIter {
        let start = addr_to_bits(&self.start);
        let end = addr_to_bits(&self.end);
        let first = match last {
            Some(l) if self.contains(&l) => {
                let l = addr_to_bits(&l);
                if l == end {
                    start
                } else {
                    l + 1
                }
            }
            _ => start,
        };
        RangeIter {
            family: self.start,
            start,
            end,
            next: first,
            remaining: self.size(),
        }
    }

    /// The address with the range's prefix length, as handed to the pod.
    pub fn to_net(&self, addr: IpAddr) -> Result<IpNet, Error> {
        IpNet::new(addr, self.subnet.prefix_len()).map_err(|_| Error::ProtocolMismatch)
    }
}

#[derive(Debug)]
pub struct RangeIter {
    family: IpAddr,
    start: u128,
    end: u128,
    next: u128,
    remaining: u128,
}

impl Iterator for RangeIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.remaining -= 1;
        self.next = if current == self.end {
            self.start
        } else {
            current + 1
        };
        Some(bits_to_addr(current, &self.family))
    }
}

fn check_member(addr: &IpAddr, subnet: &IpNet) -> Result<(), Error> {
    match (addr, subnet) {
        (IpAddr::V4(_), IpNet::V4(_)) | (IpAddr::V6(_), IpNet::V6(_)) => {}
        _ => return Err(Error::ProtocolMismatch),
    }
    if !subnet.contains(addr) {
        return Err(Error::NotInSubnet {
            addr: *addr,
            subnet: *subnet,
        });
    }
    Ok(())
}

fn subnet_size(subnet: &IpNet) -> u128 {
    let host_bits = (subnet.max_prefix_len() - subnet.prefix_len()) as u32;
    if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    }
}

pub(crate) fn addr_to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn bits_to_addr(bits: u128, family: &IpAddr) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

pub fn addr_to_index(addr: &IpAddr, cidr: &IpNet) -> Result<u128, Error> {
    check_member(addr, cidr)?;
    Ok(addr_to_bits(addr) - addr_to_bits(&cidr.network()))
}

pub fn index_to_addr(index: u128, cidr: &IpNet) -> IpAddr {
    let network = cidr.network();
    bits_to_addr(addr_to_bits(&network) + index, &network)
}
