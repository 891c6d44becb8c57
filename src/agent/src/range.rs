use std::{
    net::IpAddr,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use ipnet::IpNet;
use podipam_ipam::{
    allocator::{RangeAllocator, Reservation},
    range::{CanonicalRange, Range},
};
use podipam_store::{DiskStore, JsonCodec};
use redb::Database;
use serde::{Deserialize, Serialize};

use super::error::Error;

const LAST_RESERVED_SUFFIX: &str = ".last_reserved";

/// Persisted per allocated address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRecord {
    pub owner: String,
    pub interface: String,
}

/// Static range backend of one network.
///
/// Records live in the `<network>` table keyed by address, and the scan
/// position lives in `<network>.last_reserved` keyed by range id.
pub struct RangeIpam {
    network: String,
    range: CanonicalRange,
    records: DiskStore<RangeRecord>,
    last_reserved: DiskStore<IpAddr>,
    lock: Mutex<()>,
}

impl RangeIpam {
    pub fn new(db: Arc<Database>, network: &str, range: &Range) -> Result<RangeIpam, Error> {
        let range = range.canonicalize().map_err(Error::Ipam)?;
        let records = DiskStore::new(db.clone(), network, JsonCodec).map_err(Error::Store)?;
        let last_reserved = DiskStore::new(
            db,
            &format!("{network}{LAST_RESERVED_SUFFIX}"),
            JsonCodec,
        )
        .map_err(Error::Store)?;
        Ok(RangeIpam {
            network: network.to_string(),
            range,
            records,
            last_reserved,
            lock: Mutex::new(()),
        })
    }

    pub fn range(&self) -> &CanonicalRange {
        &self.range
    }

    pub fn reservations(&self) -> Result<Vec<Reservation>, Error> {
        let entries = self.records.entries().map_err(Error::Store)?;
        let mut reservations = Vec::with_capacity(entries.len());
        for (key, record) in entries {
            match IpAddr::from_str(&key) {
                Ok(address) => reservations.push(Reservation::new(
                    address,
                    &record.owner,
                    &record.interface,
                )),
                Err(_) => {
                    tracing::warn!(network = self.network, key, "Ignore malformed record key")
                }
            }
        }
        reservations.sort_by_key(|r| r.address);
        Ok(reservations)
    }

    /// Allocate an address for `owner` on `interface`.
    ///
    /// The first requested address inside the subnet is reserved as is,
    /// otherwise the range is scanned from the last reserved address.
    /// Allocating twice for the same owner and interface returns the same address.
    pub fn allocate(
        &self,
        owner: &str,
        interface: &str,
        requested: &[IpAddr],
    ) -> Result<IpNet, Error> {
        let _guard = self.lock.lock().map_err(|_| Error::Lock)?;
        let reservations = self.reservations()?;
        if let Some(r) = reservations
            .iter()
            .find(|r| r.owner == owner && r.interface == interface)
        {
            return self.range.to_net(r.address).map_err(Error::Ipam);
        }

        let allocator = RangeAllocator::new(&self.range);
        let address = match requested.iter().find(|a| self.range.subnet.contains(*a)) {
            Some(address) => {
                allocator
                    .reserve(*address, &reservations, owner, interface)
                    .map_err(Error::Ipam)?;
                *address
            }
            None => {
                let last = self.last_reserved.get(&self.range.id()).ok();
                let (address, _) = allocator
                    .assign(&reservations, last, owner, interface)
                    .map_err(Error::Ipam)?;
                address
            }
        };
        let net = self.range.to_net(address).map_err(Error::Ipam)?;

        self.records
            .put(
                &address.to_string(),
                RangeRecord {
                    owner: owner.to_string(),
                    interface: interface.to_string(),
                },
            )
            .map_err(Error::Store)?;
        if let Err(e) = self.last_reserved.put(&self.range.id(), address) {
            tracing::warn!(
                network = self.network,
                address = %address,
                error = %e,
                "Failed to record the last reserved address"
            );
        }
        Ok(net)
    }

    /// Release everything `owner` holds on `interface`. Releasing nothing is not an error.
    pub fn release(&self, owner: &str, interface: &str) -> Result<Vec<IpAddr>, Error> {
        let _guard = self.lock.lock().map_err(|_| Error::Lock)?;
        let reservations = self.reservations()?;
        let (released, _) =
            RangeAllocator::new(&self.range).release_owner(owner, interface, &reservations);
        for address in released.iter() {
            self.records
                .delete(&address.to_string())
                .map_err(Error::Store)?;
        }
        Ok(released)
    }

    /// Release one address regardless of its owner. Returns whether it was allocated.
    pub fn release_address(&self, address: &IpAddr) -> Result<bool, Error> {
        let _guard = self.lock.lock().map_err(|_| Error::Lock)?;
        let key = address.to_string();
        if !self.records.contains(&key).map_err(Error::Store)? {
            return Ok(false);
        }
        self.records.delete(&key).map_err(Error::Store)?;
        Ok(true)
    }

    pub fn get(&self, owner: &str, interface: &str) -> Result<Option<IpNet>, Error> {
        self.reservations()?
            .iter()
            .find(|r| r.owner == owner && r.interface == interface)
            .map(|r| self.range.to_net(r.address).map_err(Error::Ipam))
            .transpose()
    }

    pub fn purge_tombstones(&self, grace: Duration) -> Result<usize, Error> {
        let records = self
            .records
            .purge_tombstones(grace)
            .map_err(Error::Store)?;
        let positions = self
            .last_reserved
            .purge_tombstones(grace)
            .map_err(Error::Store)?;
        Ok(records + positions)
    }
}
