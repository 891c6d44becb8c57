use std::{collections::HashSet, net::IpAddr};

use serde::{Deserialize, Serialize};

use super::{error::Error, range::CanonicalRange};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub address: IpAddr,
    pub owner: String,
    pub interface: String,
    pub allocated: bool,
}

impl Reservation {
    pub fn new(address: IpAddr, owner: &str, interface: &str) -> Reservation {
        Reservation {
            address,
            owner: owner.to_string(),
            interface: interface.to_string(),
            allocated: true,
        }
    }
}

/// Stateless round-robin allocator over a single range.
///
/// The caller owns the reservation list and the scan position and is
/// responsible for persisting both after a successful [`assign`](Self::assign).
#[derive(Debug, Clone, Copy)]
pub struct RangeAllocator<'a> {
    range: &'a CanonicalRange,
}

impl<'a> RangeAllocator<'a> {
    pub fn new(range: &'a CanonicalRange) -> RangeAllocator<'a> {
        RangeAllocator { range }
    }

    pub fn range(&self) -> &CanonicalRange {
        self.range
    }

    pub fn assign(
        &self,
        reservations: &[Reservation],
        last_reserved: Option<IpAddr>,
        owner: &str,
        interface: &str,
    ) -> Result<(IpAddr, Vec<Reservation>), Error> {
        let taken: HashSet<IpAddr> = reservations
            .iter()
            .filter(|r| r.allocated)
            .map(|r| r.address)
            .collect();

        let addr = self
            .range
            .iter_from(last_reserved)
            .find(|a| !taken.contains(a) && !self.range.is_excluded(a))
            .ok_or(Error::RangeExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;

        let mut updated = reservations.to_vec();
        match updated.iter_mut().find(|r| r.address == addr) {
            Some(r) => {
                r.owner = owner.to_string();
                r.interface = interface.to_string();
                r.allocated = true;
            }
            None => updated.push(Reservation::new(addr, owner, interface)),
        }
        Ok((addr, updated))
    }

    /// Reserve a specific address, as requested through the `IP` CNI argument.
    pub fn reserve(
        &self,
        address: IpAddr,
        reservations: &[Reservation],
        owner: &str,
        interface: &str,
    ) -> Result<Vec<Reservation>, Error> {
        if !self.range.contains(&address) || self.range.is_excluded(&address) {
            return Err(Error::OutOfRange(address));
        }
        let mut updated = reservations.to_vec();
        match updated.iter_mut().find(|r| r.address == address) {
            Some(r) if r.allocated => return Err(Error::AddressInUse(address)),
            Some(r) => {
                r.owner = owner.to_string();
                r.interface = interface.to_string();
                r.allocated = true;
            }
            None => updated.push(Reservation::new(address, owner, interface)),
        }
        Ok(updated)
    }

    /// Releasing an address that is not reserved is a no-op.
    pub fn release(&self, address: &IpAddr, reservations: &[Reservation]) -> Vec<Reservation> {
        let mut updated = reservations.to_vec();
        for r in updated.iter_mut().filter(|r| r.address.eq(address)) {
            clear(r);
        }
        updated
    }

    /// Release everything held by `owner` on `interface`.
    /// Returns the released addresses alongside the updated list.
    pub fn release_owner(
        &self,
        owner: &str,
        interface: &str,
        reservations: &[Reservation],
    ) -> (Vec<IpAddr>, Vec<Reservation>) {
        let mut released = Vec::new();
        let mut updated = reservations.to_vec();
        for r in updated
            .iter_mut()
            .filter(|r| r.allocated && r.owner == owner && r.interface == interface)
        {
            released.push(r.address);
            clear(r);
        }
        (released, updated)
    }
}

fn clear(r: &mut Reservation) {
    r.allocated = false;
    r.owner.clear();
    r.interface.clear();
}
